//! Agent Runtime (C3).
//!
//! Generic ReAct-style loop: seed a system prompt and a user instruction,
//! stream model output, dispatch tool-call chunks to the Tool Bridge, and
//! keep going until the model stops requesting tools or the recursion
//! limit trips. Shaped after the tool-loop in the upstream crate's
//! `Agent::send` (detect a tool call in the response, execute it, feed the
//! result back as a follow-up message, repeat) but generalized to a remote
//! bridge and a bounded recursion limit rather than a fixed 5-iteration cap.

use crate::cloudllm::client_wrapper::Message;
use crate::error::AgentRuntimeError;
use crate::model::{system_message, tool_result_message, user_message, Chunk, ModelHandle};
use crate::tool_bridge::ToolBridge;
use crate::tracker::RunTracker;
use tokio_util::sync::CancellationToken;

/// Runs one agent to completion.
///
/// `on_output` is invoked synchronously for every text chunk, mirroring the
/// per-chunk output callback contract in §4.3. Returns `Ok(None)` only when
/// cancellation happens before any text was produced; otherwise the
/// concatenation of all text chunks emitted across every turn.
pub async fn run(
    name: &str,
    system_prompt: &str,
    tool_bridge: &dyn ToolBridge,
    model: &ModelHandle,
    user_instruction: &str,
    mut on_output: impl FnMut(&str),
    ctx: &CancellationToken,
    recursion_limit: usize,
    tracker: &RunTracker,
) -> Result<Option<String>, AgentRuntimeError> {
    let mut messages: Vec<Message> = vec![system_message(system_prompt.to_string()), user_message(user_instruction.to_string())];
    let mut final_text = String::new();
    let mut turn = 0usize;

    loop {
        if ctx.is_cancelled() {
            log::info!("{}: cancelled before turn {}", name, turn);
            return Err(AgentRuntimeError::Cancelled);
        }
        if turn >= recursion_limit {
            return Err(AgentRuntimeError::RecursionLimitExceeded { limit: recursion_limit });
        }

        let chunks = match model.stream(&messages, None).await {
            Ok(chunks) => chunks,
            Err(e) => {
                log::warn!("{}: streaming call failed, falling back to single-shot: {}", name, e);
                match model.stream(&messages, None).await {
                    Ok(chunks) => chunks,
                    Err(e2) => return Err(AgentRuntimeError::Upstream(e2.to_string())),
                }
            }
        };

        let mut requested_tool = false;
        for chunk in chunks {
            if ctx.is_cancelled() {
                log::info!("{}: cancelled mid-turn {}", name, turn);
                return Err(AgentRuntimeError::Cancelled);
            }
            match chunk {
                Chunk::Text(text) => {
                    on_output(&text);
                    final_text.push_str(&text);
                }
                Chunk::ToolCall { name: tool_name, args } => {
                    requested_tool = true;
                    messages.push(Message {
                        role: crate::cloudllm::client_wrapper::Role::Assistant,
                        content: std::sync::Arc::from(format!("[tool_call {}]", tool_name)),
                        tool_calls: vec![],
                    });
                    let call_id = format!("{}-{}", tool_name, turn);
                    let result = tool_bridge.run_tool(&tool_name, args).await;
                    tracker.record_tool_call();
                    match result {
                        Ok(output) => {
                            on_output(&output);
                            messages.push(tool_result_message(call_id, output));
                        }
                        Err(e) => {
                            let message = format!("tool {} failed: {}", tool_name, e);
                            on_output(&message);
                            messages.push(tool_result_message(call_id, message));
                        }
                    }
                }
                Chunk::ToolResult(text) => {
                    on_output(&text);
                }
                Chunk::End => {}
            }
        }

        turn += 1;
        if !requested_tool {
            break;
        }
    }

    Ok(Some(final_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{ClientWrapper, NativeToolCall, ToolDefinition};
    use crate::error::ToolBridgeError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NoopBridge;

    #[async_trait]
    impl ToolBridge for NoopBridge {
        async fn list_tools(&self) -> Result<Vec<crate::tool_bridge::ToolDescriptor>, ToolBridgeError> {
            Ok(vec![])
        }
        async fn run_tool(&self, _name: &str, _args: serde_json::Value) -> Result<String, ToolBridgeError> {
            Ok("tool output".to_string())
        }
    }

    /// Answers with one tool call on the first turn, then plain text.
    struct ScriptedClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClientWrapper for ScriptedClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(Message {
                    role: crate::cloudllm::client_wrapper::Role::Assistant,
                    content: Arc::from(""),
                    tool_calls: vec![NativeToolCall {
                        id: "call_1".to_string(),
                        name: "get_issue".to_string(),
                        arguments: serde_json::json!({"iid": 1}),
                    }],
                })
            } else {
                Ok(Message {
                    role: crate::cloudllm::client_wrapper::Role::Assistant,
                    content: Arc::from("CODING_PHASE_COMPLETE"),
                    tool_calls: vec![],
                })
            }
        }
        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn cancelled_before_first_turn_returns_cancelled_error() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let bridge = NoopBridge;
        let model = ModelHandle::from_client(Arc::new(ScriptedClient { calls: AtomicUsize::new(0) }), 0);
        let tracker = RunTracker::new();
        let result = run("coder", "sys", &bridge, &model, "do it", |_| {}, &ctx, 10, &tracker).await;
        assert!(matches!(result, Err(AgentRuntimeError::Cancelled)));
    }

    #[tokio::test]
    async fn runs_a_tool_call_then_returns_final_text() {
        let ctx = CancellationToken::new();
        let bridge = NoopBridge;
        let model = ModelHandle::from_client(Arc::new(ScriptedClient { calls: AtomicUsize::new(0) }), 0);
        let mut output = String::new();
        let tracker = RunTracker::new();
        let result = run("coder", "sys", &bridge, &model, "do it", |chunk| output.push_str(chunk), &ctx, 10, &tracker)
            .await
            .unwrap()
            .unwrap();
        assert!(result.contains("CODING_PHASE_COMPLETE"));
        assert!(output.contains("tool output"));
    }

    #[tokio::test]
    async fn recursion_limit_of_zero_fails_immediately() {
        let ctx = CancellationToken::new();
        let bridge = NoopBridge;
        let model = ModelHandle::from_client(Arc::new(ScriptedClient { calls: AtomicUsize::new(0) }), 0);
        let tracker = RunTracker::new();
        let result = run("coder", "sys", &bridge, &model, "do it", |_| {}, &ctx, 0, &tracker).await;
        assert!(matches!(result, Err(AgentRuntimeError::RecursionLimitExceeded { limit: 0 })));
    }
}
