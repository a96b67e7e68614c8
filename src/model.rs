//! Model Caller (C2).
//!
//! `make_model(provider, model, temperature, max_retries)` builds a
//! [`ModelHandle`] wrapping one of the concrete [`ClientWrapper`]
//! implementations in [`crate::cloudllm::clients`]. Configuration is read
//! from the process-wide [`crate::config::ConfigHandle`] at call time, not
//! cached, so a `start_system` override is observed by the next call.

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
use crate::cloudllm::clients::{claude, gemini, grok, openai};
use crate::config::{Config, Provider};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// A single unit of streamed model output (§4.2).
#[derive(Debug, Clone)]
pub enum Chunk {
    Text(String),
    ToolCall { name: String, args: serde_json::Value },
    ToolResult(String),
    End,
}

/// A ready-to-use model handle bound to one provider/model/temperature.
#[derive(Clone)]
pub struct ModelHandle {
    client: Arc<dyn ClientWrapper>,
    max_retries: u32,
}

impl ModelHandle {
    /// Build a handle directly from a [`ClientWrapper`], bypassing provider
    /// dispatch. Used by tests and by callers that already hold a
    /// pre-constructed client.
    pub fn from_client(client: Arc<dyn ClientWrapper>, max_retries: u32) -> Self {
        ModelHandle { client, max_retries }
    }

    /// Run one non-streaming turn and translate the result into a `Chunk`
    /// sequence, retrying transient failures up to `max_retries` times with
    /// a short fixed backoff. The upstream `ClientWrapper` streaming path
    /// (`send_message_stream`) resolves to `Ok(None)` for providers with no
    /// streaming support, so the runtime treats this as the baseline path
    /// and upgrades to true streaming only when a provider offers it.
    pub async fn stream(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Vec<Chunk>, Box<dyn Error + Send + Sync>> {
        let mut last_err: Option<Box<dyn Error + Send + Sync>> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            }
            match self.client.send_message(messages, tools.clone()).await {
                Ok(message) => {
                    let mut chunks = Vec::new();
                    if !message.tool_calls.is_empty() {
                        for call in message.tool_calls {
                            chunks.push(Chunk::ToolCall {
                                name: call.name,
                                args: call.arguments,
                            });
                        }
                    } else {
                        chunks.push(Chunk::Text(message.content.to_string()));
                    }
                    chunks.push(Chunk::End);
                    return Ok(chunks);
                }
                Err(e) => {
                    log::warn!("model call attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(Box::<dyn Error + Send + Sync>::from(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| "model call failed with no recorded error".into()))
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }
}

fn api_key_env_var(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAi => "OPEN_AI_SECRET",
        Provider::Claude => "ANTHROPIC_KEY",
        Provider::Gemini => "GEMINI_KEY",
        Provider::Grok => "XAI_KEY",
    }
}

fn build_client(
    provider: Provider,
    model: &str,
    temperature: f32,
) -> Result<Arc<dyn ClientWrapper>, Box<dyn Error + Send + Sync>> {
    let key_var = api_key_env_var(provider);
    let key = std::env::var(key_var)
        .map_err(|_| format!("{} is not set; required for provider {:?}", key_var, provider))?;
    let client: Arc<dyn ClientWrapper> = match provider {
        Provider::OpenAi => Arc::new(openai::OpenAIClient::new_with_model_string(&key, model).with_temperature(temperature)),
        Provider::Claude => Arc::new(claude::ClaudeClient::new_with_model_str(&key, model).with_temperature(temperature)),
        Provider::Gemini => Arc::new(gemini::GeminiClient::new_with_model_string(&key, model).with_temperature(temperature)),
        Provider::Grok => Arc::new(grok::GrokClient::new_with_model_str(&key, model).with_temperature(temperature)),
    };
    Ok(client)
}

/// Build a [`ModelHandle`] for the given provider/model, applying `temperature`
/// to every request the resulting client sends.
pub fn make_model(
    provider: Provider,
    model: &str,
    temperature: f32,
    max_retries: u32,
) -> Result<ModelHandle, Box<dyn Error + Send + Sync>> {
    let client = build_client(provider, model, temperature)?;
    Ok(ModelHandle { client, max_retries })
}

/// Convenience wrapper that reads provider/model/temperature straight off a
/// [`Config`] snapshot (the common case for the Agent Runtime).
pub fn make_model_from_config(config: &Config) -> Result<ModelHandle, Box<dyn Error + Send + Sync>> {
    make_model(config.provider, &config.model, config.temperature, 2)
}

pub fn system_message(content: impl Into<Arc<str>>) -> Message {
    Message { role: Role::System, content: content.into(), tool_calls: vec![] }
}

pub fn user_message(content: impl Into<Arc<str>>) -> Message {
    Message { role: Role::User, content: content.into(), tool_calls: vec![] }
}

pub fn tool_result_message(call_id: String, content: impl Into<Arc<str>>) -> Message {
    Message { role: Role::Tool { call_id }, content: content.into(), tool_calls: vec![] }
}
