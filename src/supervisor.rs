//! Supervisor (C9).
//!
//! Top-level state machine: PHASE 1 planning → PHASE 1.5 planning merge →
//! PHASE 2 fetch+prioritize → PHASE 3 per-issue Coding→Testing→Review with
//! retry. Owns checkpointing and is the only component that mutates
//! `RunState`.

use crate::checkpoint::CheckpointManager;
use crate::config::ConfigHandle;
use crate::domain::{IssueState, IssueStatus, Phase, RunState};
use crate::error::SupervisorError;
use crate::events::{Event, PipelineStageStatus, SharedSink, Stage};
use crate::executor::AgentExecutor;
use crate::issue_manager::IssueManager;
use crate::planning_manager::PlanningManager;
use crate::tool_bridge::ToolBridge;
use crate::tracker::CsvExporter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const ISSUE_RETRY_MAX_ATTEMPTS: u32 = 3;
const ISSUE_RETRY_BASE_DELAY_SECS: u64 = 10;
const INTER_ISSUE_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Analyze,
    Implement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initializing,
    Planning,
    Preparation,
    Implementing,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: SupervisorState,
    pub completed_issues: Vec<u64>,
    pub failed_issues: Vec<u64>,
    pub cancelled: bool,
    pub failure_reason: Option<String>,
}

pub struct Supervisor {
    project_id: String,
    tool_bridge: Arc<dyn ToolBridge>,
    executor: Arc<AgentExecutor>,
    checkpoints: CheckpointManager,
    csv: CsvExporter,
    config: ConfigHandle,
    sink: SharedSink,
    run_id: String,
}

impl Supervisor {
    pub fn new(
        project_id: String,
        run_id: String,
        tool_bridge: Arc<dyn ToolBridge>,
        executor: Arc<AgentExecutor>,
        logs_root: impl Into<std::path::PathBuf>,
        config: ConfigHandle,
        sink: SharedSink,
    ) -> Self {
        let logs_root = logs_root.into();
        Supervisor {
            project_id,
            tool_bridge,
            executor,
            checkpoints: CheckpointManager::new(logs_root.clone(), &run_id),
            csv: CsvExporter::new(logs_root),
            config,
            sink,
            run_id,
        }
    }

    fn emit_status(&self, running: bool, stage: &str, agent: Option<&str>, issue: Option<u64>, branch: Option<&str>) {
        self.sink.emit(Event::SystemStatus {
            running,
            current_stage: Some(stage.to_string()),
            current_agent: agent.map(|s| s.to_string()),
            current_issue: issue,
            current_branch: branch.map(|s| s.to_string()),
        });
    }

    fn emit_output(&self, agent: &str, content: &str) {
        self.sink.emit(Event::AgentOutput { agent: agent.to_string(), content: content.to_string(), level: "info".to_string() });
    }

    fn emit_pipeline(&self, stage: Stage, status: PipelineStageStatus, details: serde_json::Value) {
        self.sink.emit(Event::PipelineUpdate { stage, status, details });
    }

    fn emit_error(&self, message: &str, traceback: Option<String>) {
        self.sink.emit(Event::Error { message: message.to_string(), traceback });
    }

    /// `execute(mode, specific_issue, resume)`.
    pub async fn execute(
        &self,
        mode: RunMode,
        specific_issue: Option<u64>,
        resume: bool,
        ctx: CancellationToken,
    ) -> Result<RunSummary, SupervisorError> {
        self.config.mark_running();
        let started = Instant::now();
        let mut state = SupervisorState::Initializing;
        self.emit_status(true, "initializing", None, None, None);

        let tool_list = self.tool_bridge.list_tools().await;
        if let Err(e) = tool_list {
            self.config.mark_stopped();
            self.emit_error(&format!("tool bridge unreachable at startup: {}", e), None);
            return Err(SupervisorError::ToolBridgeDown(e.to_string()));
        }

        let mut run_state = RunState::new(self.run_id.clone(), self.project_id.clone());

        if resume {
            if let Ok(Some(checkpoint)) = self.checkpoints.load().await {
                log::info!("resuming run {} from checkpoint stage={}", self.run_id, checkpoint.stage);
                let already_completed = checkpoint.stage == "completed";
                run_state = checkpoint;
                if already_completed {
                    self.config.mark_stopped();
                    self.emit_status(false, "completed", None, None, None);
                    return Ok(RunSummary {
                        state: SupervisorState::Completed,
                        completed_issues: run_state.completed_issues.into_iter().collect(),
                        failed_issues: run_state.failed_issues.into_iter().collect(),
                        cancelled: false,
                        failure_reason: None,
                    });
                }
            }
        }

        let issue_manager = IssueManager::new(self.tool_bridge.as_ref());
        let planning_manager = PlanningManager::new();

        // ---- PHASE 1: Planning ----
        state = SupervisorState::Planning;
        self.emit_status(true, "planning", Some("planning"), None, None);
        let executor = self.executor.clone();
        let apply = mode == RunMode::Implement;
        let project_id = self.project_id.clone();
        let sink = self.sink.clone();
        let ctx_planning = ctx.clone();
        let planning_ok = planning_manager
            .execute_planning_with_retry(
                || {
                    let executor = executor.clone();
                    let project_id = project_id.clone();
                    let sink = sink.clone();
                    let ctx = ctx_planning.clone();
                    async move {
                        let outcome = executor
                            .execute_planning(&project_id, apply, &ctx, |chunk| {
                                sink.emit(Event::AgentOutput {
                                    agent: "planning".to_string(),
                                    content: chunk.to_string(),
                                    level: "info".to_string(),
                                });
                            })
                            .await;
                        outcome.final_text.ok_or_else(|| "planning produced no output".to_string())
                    }
                },
                apply,
            )
            .await;

        if !planning_ok {
            state = SupervisorState::Failed;
            run_state.stage = "planning_failed".to_string();
            self.checkpoint(&run_state).await?;
            self.config.mark_stopped();
            self.emit_status(false, "failed", None, None, None);
            return Err(SupervisorError::PlanningFailed("planning retries exhausted".to_string()));
        }
        run_state.stage = "after_planning".to_string();
        self.checkpoint(&run_state).await?;

        if mode == RunMode::Analyze {
            state = SupervisorState::Completed;
            self.config.mark_stopped();
            self.emit_status(false, "completed", None, None, None);
            return Ok(RunSummary {
                state,
                completed_issues: vec![],
                failed_issues: vec![],
                cancelled: false,
                failure_reason: None,
            });
        }

        // ---- PHASE 1.5: Planning Merge ----
        state = SupervisorState::Preparation;
        if let Ok(branches_raw) = self.tool_bridge.run_tool("list_branches", serde_json::json!({ "project_id": self.project_id })).await {
            if let Ok(branches) = serde_json::from_str::<Vec<String>>(&branches_raw) {
                if let Some(branch) = branches.iter().find(|b| b.starts_with("planning-structure")) {
                    let synthetic = crate::domain::planning_synthetic_issue();
                    self.executor.reset_for_new_issue();
                    let outcome = self
                        .executor
                        .execute_review(&synthetic, branch, &self.project_id, &ctx, |chunk| self.emit_output("review", chunk))
                        .await;
                    if outcome.ok {
                        let _ = planning_manager.load_plan_from_repo(self.tool_bridge.as_ref(), &self.project_id, "main").await;
                    } else {
                        log::warn!("planning merge review did not succeed; falling back to heuristic prioritization");
                    }
                }
            }
        }

        // ---- PHASE 2: Preparation ----
        let issues = issue_manager.fetch_open_issues(&self.project_id).await.map_err(|e| {
            SupervisorError::ToolBridgeDown(format!("fetch_open_issues failed: {}", e))
        })?;

        // A resumed run seeds its plan and completion/failure sets from the
        // checkpoint (§4.7) rather than recomputing them from scratch.
        let plan = match run_state.plan.clone() {
            Some(restored) => Some(restored),
            None => planning_manager.plan().await,
        };
        let mut completion_cache = std::collections::HashMap::new();
        for issue in &issues {
            let done = run_state.completed_issues.contains(&issue.iid)
                || issue_manager.is_completed(&self.project_id, issue).await.unwrap_or(false);
            completion_cache.insert(issue.iid, done);
        }
        let mut prioritized = planning_manager.apply_prioritization(issues, plan.as_ref(), |issue| {
            *completion_cache.get(&issue.iid).unwrap_or(&false)
        });

        // Issues already recorded as failed in the checkpoint are not
        // retried on resume; only issues in neither set continue.
        prioritized.retain(|i| !run_state.failed_issues.contains(&i.iid));

        if let Some(only) = specific_issue {
            prioritized.retain(|i| i.iid == only);
        }

        run_state.plan = plan;
        run_state.stage = "before_implementation".to_string();
        self.checkpoint(&run_state).await?;

        // ---- PHASE 3: Implementation ----
        state = SupervisorState::Implementing;
        self.emit_status(true, "implementing", None, None, None);

        // Issues interrupted by cancellation are reported as failed in this
        // run's summary, but are not added to `run_state.failed_issues` so a
        // later `--resume` retries them instead of skipping them forever.
        let mut cancelled_issues = std::collections::BTreeSet::new();

        for issue in &prioritized {
            if ctx.is_cancelled() {
                break;
            }

            if *completion_cache.get(&issue.iid).unwrap_or(&false) {
                run_state.completed_issues.insert(issue.iid);
                issue_manager.track_completed(issue).await;
                self.csv
                    .append_issue_row(&self.run_id, &{
                        let mut s = IssueState::new(issue.iid);
                        s.status = IssueStatus::Skipped;
                        s
                    })
                    .await
                    .ok();
                continue;
            }

            let branch = crate::issue_manager::feature_branch(issue);
            let mut issue_state = IssueState::new(issue.iid);
            self.executor.reset_for_new_issue();
            self.emit_status(true, "coding", None, Some(issue.iid), Some(&branch));

            let mut issue_succeeded = false;
            for attempt in 0..ISSUE_RETRY_MAX_ATTEMPTS {
                if attempt > 0 {
                    let delay = Duration::from_secs(ISSUE_RETRY_BASE_DELAY_SECS * attempt as u64);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancelled() => break,
                    }
                }
                if ctx.is_cancelled() {
                    break;
                }

                let coding_start = Instant::now();
                let coding = self
                    .executor
                    .execute_coding(issue, &branch, &self.project_id, &ctx, |chunk| self.emit_output("coding", chunk))
                    .await;
                issue_state.record_attempt(Phase::Coding, coding.ok, coding_start.elapsed().as_millis() as u64);
                self.emit_pipeline(Stage::Coding, if coding.ok { PipelineStageStatus::Completed } else { PipelineStageStatus::Failed }, serde_json::json!({ "issue": issue.iid }));
                self.csv.write_issue_metrics(&self.run_id, &issue_state).await.ok();
                if !coding.ok {
                    continue;
                }

                let testing_start = Instant::now();
                let testing = self
                    .executor
                    .execute_testing(issue, &branch, &self.project_id, &ctx, |chunk| self.emit_output("testing", chunk))
                    .await;
                issue_state.record_attempt(Phase::Testing, testing.ok, testing_start.elapsed().as_millis() as u64);
                self.emit_pipeline(Stage::Testing, if testing.ok { PipelineStageStatus::Completed } else { PipelineStageStatus::Failed }, serde_json::json!({ "issue": issue.iid }));
                self.csv.write_issue_metrics(&self.run_id, &issue_state).await.ok();
                if !testing.ok {
                    log::warn!("testing failed for issue {}; proceeding to review anyway", issue.iid);
                }

                let review_start = Instant::now();
                let review = self
                    .executor
                    .execute_review(issue, &branch, &self.project_id, &ctx, |chunk| self.emit_output("review", chunk))
                    .await;
                issue_state.record_attempt(Phase::Review, review.ok, review_start.elapsed().as_millis() as u64);
                self.emit_pipeline(Stage::Review, if review.ok { PipelineStageStatus::Completed } else { PipelineStageStatus::Failed }, serde_json::json!({ "issue": issue.iid }));
                self.csv.write_issue_metrics(&self.run_id, &issue_state).await.ok();

                if review.ok {
                    issue_succeeded = true;
                    break;
                }
            }

            if ctx.is_cancelled() && !issue_succeeded {
                issue_state.status = IssueStatus::Failed;
                issue_state.errors.push("canceled".to_string());
                cancelled_issues.insert(issue.iid);
                issue_manager.track_failed(issue).await;
            } else if issue_succeeded {
                issue_state.status = IssueStatus::Completed;
                run_state.completed_issues.insert(issue.iid);
                issue_manager.track_completed(issue).await;
            } else {
                issue_state.status = IssueStatus::Failed;
                run_state.failed_issues.insert(issue.iid);
                issue_manager.track_failed(issue).await;
            }

            self.csv.write_issue_report(&self.run_id, &issue_state).await.ok();
            self.csv.append_issue_row(&self.run_id, &issue_state).await.ok();
            run_state.metrics = self.executor.tracker().snapshot();
            run_state.stage = format!(
                "after_issue_{}_{}",
                issue.iid,
                if issue_state.status == IssueStatus::Completed { "completed" } else { "failed" }
            );
            self.checkpoint(&run_state).await?;

            if ctx.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(INTER_ISSUE_COOLDOWN) => {}
                _ = ctx.cancelled() => {}
            }
        }

        let cancelled = ctx.is_cancelled();
        state = if cancelled { SupervisorState::Failed } else { SupervisorState::Completed };
        run_state.stage = if cancelled { "canceled".to_string() } else { "completed".to_string() };
        self.checkpoint(&run_state).await?;
        self.csv.append_run_row(&run_state, started.elapsed()).await.ok();

        self.config.mark_stopped();
        self.emit_status(false, if cancelled { "failed" } else { "completed" }, None, None, None);

        let mut failed_issues: Vec<u64> = run_state.failed_issues.into_iter().collect();
        failed_issues.extend(cancelled_issues);
        failed_issues.sort_unstable();
        failed_issues.dedup();

        Ok(RunSummary {
            state,
            completed_issues: run_state.completed_issues.into_iter().collect(),
            failed_issues,
            cancelled,
            failure_reason: if cancelled { Some("canceled".to_string()) } else { None },
        })
    }

    async fn checkpoint(&self, state: &RunState) -> Result<(), SupervisorError> {
        self.checkpoints
            .save(state)
            .await
            .map_err(|e| SupervisorError::CheckpointWriteFailure(e.to_string()))
    }
}
