//! Agent Executor (C8).
//!
//! Per-role wrappers around the Agent Runtime that build each phase's user
//! instruction, enforce the per-role timeout, classify the result via
//! Completion Markers, and — for Review — enforce the pipeline-ID gate
//! against what Testing last observed. Owns the cross-agent `current_plan`
//! and `testing_pipeline_id` fields the component design calls out as
//! process-wide-in-spirit but deliberately kept as explicit fields here
//! (§9 "keep the field on the executor, but make it a typed struct").

use crate::agent_runtime;
use crate::completion::{self, Role as CompletionRole};
use crate::config::ConfigHandle;
use crate::domain::Issue;
use crate::model;
use crate::tool_bridge::ToolBridge;
use crate::tracker::RunTracker;
use regex::Regex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const PLANNING_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const CODING_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const TESTING_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const REVIEW_TIMEOUT: Duration = Duration::from_secs(15 * 60);

fn pipeline_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)pipeline(?:\s+id)?\s*:?\s*#?(\d+)").unwrap())
}

/// Pulls the first pipeline ID mentioned in an agent's final output. The
/// core does not validate this against the remote beyond the gate in
/// `execute_review` — whatever the agent reports is authoritative.
fn extract_pipeline_id(text: &str) -> Option<i64> {
    pipeline_id_regex().captures(text)?.get(1)?.as_str().parse().ok()
}

/// Result of one phase invocation, returned alongside the boolean outcome
/// so the supervisor can record it on the current `IssueState`.
pub struct PhaseOutcome {
    pub ok: bool,
    pub final_text: Option<String>,
    pub pipeline_id: Option<i64>,
}

pub struct AgentExecutor {
    tool_bridge: Arc<dyn ToolBridge>,
    config: ConfigHandle,
    tracker: Arc<RunTracker>,
    current_plan: RwLock<String>,
    testing_pipeline_id: AtomicI64,
    has_testing_pipeline_id: std::sync::atomic::AtomicBool,
    model_override: Option<model::ModelHandle>,
}

const NO_PIPELINE: i64 = -1;

impl AgentExecutor {
    /// `config` is read fresh (via [`model::make_model_from_config`]) at the
    /// start of every phase invocation rather than once at construction, so
    /// a `start_system` override is observed by the very next call (§6.2).
    pub fn new(tool_bridge: Arc<dyn ToolBridge>, config: ConfigHandle, tracker: Arc<RunTracker>) -> Self {
        Self::new_with_model_override(tool_bridge, config, tracker, None)
    }

    /// Variant of [`AgentExecutor::new`] that pins every phase invocation to
    /// a fixed [`model::ModelHandle`] instead of rebuilding one from config on
    /// every call. Exists so integration tests can drive the supervisor end
    /// to end against a scripted [`crate::cloudllm::client_wrapper::ClientWrapper`]
    /// without touching environment variables or a real provider.
    pub fn new_with_model_override(
        tool_bridge: Arc<dyn ToolBridge>,
        config: ConfigHandle,
        tracker: Arc<RunTracker>,
        model_override: Option<model::ModelHandle>,
    ) -> Self {
        AgentExecutor {
            tool_bridge,
            config,
            tracker,
            current_plan: RwLock::new(String::new()),
            testing_pipeline_id: AtomicI64::new(NO_PIPELINE),
            has_testing_pipeline_id: std::sync::atomic::AtomicBool::new(false),
            model_override,
        }
    }

    pub async fn current_plan(&self) -> String {
        self.current_plan.read().await.clone()
    }

    fn set_testing_pipeline_id(&self, id: Option<i64>) {
        match id {
            Some(v) => {
                self.testing_pipeline_id.store(v, Ordering::SeqCst);
                self.has_testing_pipeline_id.store(true, Ordering::SeqCst);
            }
            None => self.has_testing_pipeline_id.store(false, Ordering::SeqCst),
        }
    }

    fn testing_pipeline_id(&self) -> Option<i64> {
        if self.has_testing_pipeline_id.load(Ordering::SeqCst) {
            Some(self.testing_pipeline_id.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Reset the gate at the start of each new issue; the gate only applies
    /// within a single issue's Coding→Testing→Review sequence.
    pub fn reset_for_new_issue(&self) {
        self.has_testing_pipeline_id.store(false, Ordering::SeqCst);
    }

    async fn run_phase(
        &self,
        name: &str,
        system_prompt: &str,
        instruction: String,
        timeout: Duration,
        ctx: &CancellationToken,
        mut on_output: impl FnMut(&str),
    ) -> Result<String, String> {
        self.tracker.record_agent_call();
        let config = self.config.snapshot().await;
        let recursion_limit = config.agent_recursion_limit;
        let model = match &self.model_override {
            Some(m) => m.clone(),
            None => match model::make_model_from_config(&config) {
                Ok(m) => m,
                Err(e) => return Err(format!("failed to build model handle: {}", e)),
            },
        };
        let result = tokio::time::timeout(
            timeout,
            agent_runtime::run(
                name,
                system_prompt,
                self.tool_bridge.as_ref(),
                &model,
                &instruction,
                &mut on_output,
                ctx,
                recursion_limit,
                &self.tracker,
            ),
        )
        .await;

        match result {
            Ok(Ok(Some(text))) => Ok(text),
            Ok(Ok(None)) => Err("agent runtime cancelled before producing output".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_elapsed) => Err(format!("{} timed out after {:?}", name, timeout)),
        }
    }

    /// `executePlanning(apply)`: builds the planning instruction, runs with
    /// a 10-minute timeout, stores the result as `current_plan`.
    pub async fn execute_planning(
        &self,
        project_id: &str,
        apply: bool,
        ctx: &CancellationToken,
        mut on_output: impl FnMut(&str),
    ) -> PhaseOutcome {
        let instruction = serde_json::json!({
            "projectID": project_id,
            "apply": apply,
        })
        .to_string();

        let outcome = self
            .run_phase("planning", PLANNING_SYSTEM_PROMPT, instruction, PLANNING_TIMEOUT, ctx, &mut on_output)
            .await;

        match outcome {
            Ok(text) => {
                *self.current_plan.write().await = text.clone();
                let completion = completion::check(CompletionRole::Planning, &text);
                PhaseOutcome { ok: completion.ok, final_text: Some(text), pipeline_id: None }
            }
            Err(e) => {
                on_output(&e);
                PhaseOutcome { ok: false, final_text: None, pipeline_id: None }
            }
        }
    }

    /// `executeCoding(issue, branch)`: 20-minute timeout; `COMPILATION_FAILED`
    /// is a hard failure, any mentioned pipeline ID is diagnostic only.
    pub async fn execute_coding(
        &self,
        issue: &Issue,
        branch: &str,
        project_id: &str,
        ctx: &CancellationToken,
        mut on_output: impl FnMut(&str),
    ) -> PhaseOutcome {
        let plan_json = self.current_plan().await;
        let instruction = serde_json::json!({
            "projectID": project_id,
            "issues": [issue.iid],
            "workBranch": branch,
            "planJson": plan_json,
            "pipelineConfig": serde_json::Value::Null,
        })
        .to_string();

        let outcome = self
            .run_phase("coding", CODING_SYSTEM_PROMPT, instruction, CODING_TIMEOUT, ctx, &mut on_output)
            .await;

        match outcome {
            Ok(text) => {
                let completion = completion::check(CompletionRole::Coding, &text);
                PhaseOutcome { ok: completion.ok, final_text: Some(text.clone()), pipeline_id: extract_pipeline_id(&text) }
            }
            Err(e) => {
                on_output(&e);
                PhaseOutcome { ok: false, final_text: None, pipeline_id: None }
            }
        }
    }

    /// `executeTesting(issue, branch)`: 20-minute timeout; stores the first
    /// mentioned pipeline ID as the value Review must later match.
    pub async fn execute_testing(
        &self,
        issue: &Issue,
        branch: &str,
        project_id: &str,
        ctx: &CancellationToken,
        mut on_output: impl FnMut(&str),
    ) -> PhaseOutcome {
        let _ = issue;
        let plan_json = self.current_plan().await;
        let instruction = serde_json::json!({
            "projectID": project_id,
            "workBranch": branch,
            "planJson": plan_json,
            "pipelineConfig": serde_json::Value::Null,
        })
        .to_string();

        let outcome = self
            .run_phase("testing", TESTING_SYSTEM_PROMPT, instruction, TESTING_TIMEOUT, ctx, &mut on_output)
            .await;

        match outcome {
            Ok(text) => {
                let completion = completion::check(CompletionRole::Testing, &text);
                let pipeline_id = extract_pipeline_id(&text);
                if completion.ok {
                    self.set_testing_pipeline_id(pipeline_id);
                }
                PhaseOutcome { ok: completion.ok, final_text: Some(text), pipeline_id }
            }
            Err(e) => {
                on_output(&e);
                PhaseOutcome { ok: false, final_text: None, pipeline_id: None }
            }
        }
    }

    /// `executeReview(issue, branch)`: 15-minute timeout; enforces the
    /// pipeline-ID gate when a `testing_pipeline_id` is on record. Called
    /// with the relaxed gate (no prior Testing) for the planning-merge
    /// invocation, where `testing_pipeline_id` is simply unset.
    pub async fn execute_review(
        &self,
        issue: &Issue,
        branch: &str,
        project_id: &str,
        ctx: &CancellationToken,
        mut on_output: impl FnMut(&str),
    ) -> PhaseOutcome {
        let instruction = serde_json::json!({
            "projectID": project_id,
            "workBranch": branch,
            "issueIID": issue.iid,
            "pipelineConfig": serde_json::Value::Null,
        })
        .to_string();

        let outcome = self
            .run_phase("review", REVIEW_SYSTEM_PROMPT, instruction, REVIEW_TIMEOUT, ctx, &mut on_output)
            .await;

        match outcome {
            Ok(text) => {
                let completion = completion::check(CompletionRole::Review, &text);
                let pipeline_id = extract_pipeline_id(&text);

                let gate_ok = match (self.testing_pipeline_id(), pipeline_id) {
                    (Some(expected), Some(observed)) => expected == observed,
                    (Some(_expected), None) => false,
                    (None, _) => true,
                };
                if !gate_ok {
                    log::warn!(
                        "pipeline-ID gate mismatch for issue {}: testing={:?} review={:?}",
                        issue.iid,
                        self.testing_pipeline_id(),
                        pipeline_id
                    );
                }

                PhaseOutcome { ok: completion.ok && gate_ok, final_text: Some(text), pipeline_id }
            }
            Err(e) => {
                on_output(&e);
                PhaseOutcome { ok: false, final_text: None, pipeline_id: None }
            }
        }
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }
}

const PLANNING_SYSTEM_PROMPT: &str = "You are the Planning agent. Produce docs/ORCH_PLAN.json on branch planning-structure.";
const CODING_SYSTEM_PROMPT: &str = "You are the Coding agent. Implement the assigned issue on its feature branch.";
const TESTING_SYSTEM_PROMPT: &str = "You are the Testing agent. Run the project's test suite and CI pipeline for the branch.";
const REVIEW_SYSTEM_PROMPT: &str = "You are the Review agent. Validate CI and merge the branch if it is safe to do so.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_pipeline_id_reads_first_match() {
        assert_eq!(extract_pipeline_id("ran pipeline #4260 successfully"), Some(4260));
        assert_eq!(extract_pipeline_id("Pipeline ID: 100, then 200"), Some(100));
        assert_eq!(extract_pipeline_id("no mention here"), None);
    }
}
