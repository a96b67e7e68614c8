//! Supervisor-level integration tests covering the named scenarios:
//! happy path, retry on pipeline-ID mismatch, skipping an already-merged
//! issue, and cancellation mid-issue with a later resume. Each test drives
//! the real [`Supervisor`] against a fake [`ToolBridge`] and a scripted
//! [`ClientWrapper`] injected via [`AgentExecutor::new_with_model_override`],
//! so no network access or API keys are required.

use async_trait::async_trait;
use fleetforge::cloudllm::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
use fleetforge::config::{Config, ConfigHandle};
use fleetforge::domain::{Issue, IssueRemoteState, IssueState, Phase};
use fleetforge::error::ToolBridgeError;
use fleetforge::events::{NullSink, SharedSink};
use fleetforge::executor::AgentExecutor;
use fleetforge::issue_manager::feature_branch;
use fleetforge::model::ModelHandle;
use fleetforge::supervisor::{RunMode, Supervisor};
use fleetforge::tool_bridge::{ToolBridge, ToolDescriptor};
use fleetforge::tracker::RunTracker;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A remote tool service that serves a fixed issue list and a fixed set of
/// already-merged feature branches; everything else is an empty no-op.
struct FakeToolBridge {
    issues_json: String,
    merged_branches: Vec<String>,
}

#[async_trait]
impl ToolBridge for FakeToolBridge {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolBridgeError> {
        Ok(vec![])
    }

    async fn run_tool(&self, name: &str, args: serde_json::Value) -> Result<String, ToolBridgeError> {
        match name {
            "list_issues" => Ok(self.issues_json.clone()),
            "list_branches" => Ok("[]".to_string()),
            "list_merge_requests" => {
                let branch = args.get("source_branch").and_then(|v| v.as_str()).unwrap_or("");
                if self.merged_branches.iter().any(|b| b == branch) {
                    Ok(r#"[{"state":"merged"}]"#.to_string())
                } else {
                    Ok("[]".to_string())
                }
            }
            _ => Ok("{}".to_string()),
        }
    }
}

fn issue(iid: u64, title: &str, description: &str, labels: &[&str]) -> Issue {
    Issue {
        iid,
        title: title.to_string(),
        description: description.to_string(),
        state: IssueRemoteState::Open,
        labels: labels.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
    }
}

fn issues_json(issues: &[Issue]) -> String {
    let entries: Vec<serde_json::Value> = issues
        .iter()
        .map(|i| {
            serde_json::json!({
                "iid": i.iid,
                "title": i.title,
                "description": i.description,
                "state": "opened",
                "labels": i.labels.iter().collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::Value::Array(entries).to_string()
}

/// Drives every phase off the system prompt's role sentence (the only thing
/// the four `executor.rs` phase builders have in common that's visible to a
/// `ClientWrapper`), with per-role pipeline IDs handed out in call order.
struct RoleScriptedClient {
    coding_order: Mutex<Vec<u64>>,
    coding_calls: AtomicUsize,
    testing_calls: AtomicUsize,
    review_calls: AtomicUsize,
    testing_pipelines: Vec<i64>,
    review_pipelines: Vec<i64>,
}

impl RoleScriptedClient {
    fn new(testing_pipelines: Vec<i64>, review_pipelines: Vec<i64>) -> Self {
        RoleScriptedClient {
            coding_order: Mutex::new(Vec::new()),
            coding_calls: AtomicUsize::new(0),
            testing_calls: AtomicUsize::new(0),
            review_calls: AtomicUsize::new(0),
            testing_pipelines,
            review_pipelines,
        }
    }
}

#[async_trait]
impl ClientWrapper for RoleScriptedClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let system = messages[0].content.to_string();
        let instruction = messages.get(1).map(|m| m.content.to_string()).unwrap_or_default();

        let text = if system.contains("Planning agent") {
            "PLANNING_PHASE_COMPLETE".to_string()
        } else if system.contains("Coding agent") {
            self.coding_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&instruction) {
                if let Some(iid) = json["issues"][0].as_u64() {
                    self.coding_order.lock().await.push(iid);
                }
            }
            "CODING_PHASE_COMPLETE".to_string()
        } else if system.contains("Testing agent") {
            let n = self.testing_calls.fetch_add(1, Ordering::SeqCst);
            format!("TESTING_PHASE_COMPLETE pipeline #{}", self.testing_pipelines.get(n).copied().unwrap_or(0))
        } else if system.contains("Review agent") {
            let n = self.review_calls.fetch_add(1, Ordering::SeqCst);
            format!("REVIEW_PHASE_COMPLETE pipeline #{}", self.review_pipelines.get(n).copied().unwrap_or(0))
        } else {
            String::new()
        };

        Ok(Message { role: Role::Assistant, content: std::sync::Arc::from(text.as_str()), tool_calls: vec![] })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Cancels a shared token the instant it is asked to play the Coding role,
/// simulating a `stop_system` arriving mid-phase.
struct CancelingClient {
    ctx: CancellationToken,
}

#[async_trait]
impl ClientWrapper for CancelingClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let system = messages[0].content.to_string();
        if system.contains("Coding agent") {
            self.ctx.cancel();
            return Ok(Message { role: Role::Assistant, content: std::sync::Arc::from(""), tool_calls: vec![] });
        }
        let text = if system.contains("Planning agent") { "PLANNING_PHASE_COMPLETE" } else { "" };
        Ok(Message { role: Role::Assistant, content: std::sync::Arc::from(text), tool_calls: vec![] })
    }

    fn model_name(&self) -> &str {
        "canceling"
    }
}

fn build_supervisor(
    tool_bridge: Arc<dyn ToolBridge>,
    client: Arc<dyn ClientWrapper>,
    logs_root: &std::path::Path,
    run_id: &str,
) -> Supervisor {
    let config = ConfigHandle::new(Config::from_env());
    let tracker = Arc::new(RunTracker::new());
    let model = ModelHandle::from_client(client, 0);
    let executor =
        Arc::new(AgentExecutor::new_with_model_override(tool_bridge.clone(), config.clone(), tracker, Some(model)));
    let sink: SharedSink = Arc::new(NullSink);
    Supervisor::new(
        "proj".to_string(),
        run_id.to_string(),
        tool_bridge,
        executor,
        logs_root.to_path_buf(),
        config,
        sink,
    )
}

/// S1: two fresh issues, no existing MRs, every phase succeeds on the first
/// attempt with matching pipeline IDs — both issues complete.
#[tokio::test]
async fn s1_happy_path_two_issues_complete_in_order() {
    let issues = vec![issue(1, "Add /health", "", &[]), issue(2, "Add /ping", "", &[])];
    let bridge: Arc<dyn ToolBridge> = Arc::new(FakeToolBridge { issues_json: issues_json(&issues), merged_branches: vec![] });
    let client = Arc::new(RoleScriptedClient::new(vec![100, 200], vec![100, 200]));
    let dir = tempfile::tempdir().unwrap();
    let supervisor = build_supervisor(bridge, client.clone(), dir.path(), "run-s1");

    let summary = supervisor.execute(RunMode::Implement, None, false, CancellationToken::new()).await.unwrap();

    let mut completed = summary.completed_issues.clone();
    completed.sort();
    assert_eq!(completed, vec![1, 2]);
    assert!(summary.failed_issues.is_empty());
    assert!(!summary.cancelled);
    assert_eq!(*client.coding_order.lock().await, vec![1, 2]);
}

/// S2: a single issue whose first attempt's Testing and Review pipeline IDs
/// disagree (4260 vs 4255); the supervisor retries and the second attempt's
/// pipelines match (4263), succeeding. The persisted issue report must show
/// two Review attempts, one success and one failure.
#[tokio::test]
async fn s2_retries_on_pipeline_id_mismatch_then_succeeds() {
    let issues = vec![issue(5, "Issue five", "", &[])];
    let bridge: Arc<dyn ToolBridge> = Arc::new(FakeToolBridge { issues_json: issues_json(&issues), merged_branches: vec![] });
    let client = Arc::new(RoleScriptedClient::new(vec![4260, 4263], vec![4255, 4263]));
    let dir = tempfile::tempdir().unwrap();
    let supervisor = build_supervisor(bridge, client, dir.path(), "run-s2");

    let summary = supervisor.execute(RunMode::Implement, None, false, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.completed_issues, vec![5]);

    let report_path = dir.path().join("runs").join("run-s2").join("issues").join("issue_5_report.json");
    let contents = tokio::fs::read_to_string(&report_path).await.unwrap();
    let state: IssueState = serde_json::from_str(&contents).unwrap();
    let review_attempts = state.attempts.get(&Phase::Review).expect("review attempts recorded");
    assert_eq!(review_attempts.count, 2);
    assert_eq!(review_attempts.successes, 1);
    assert_eq!(review_attempts.failures, 1);
}

/// S3: issue 7 already has a merged MR against its feature branch. The
/// supervisor must skip straight to `trackCompleted` without ever invoking
/// Coding/Testing/Review, and record the issue as skipped in the issues CSV.
#[tokio::test]
async fn s3_skips_issue_with_an_already_merged_feature_branch() {
    let seven = issue(7, "Add auth", "", &[]);
    let merged_branch = feature_branch(&seven);
    assert_eq!(merged_branch, "feature/issue-7-add-auth");

    let bridge: Arc<dyn ToolBridge> =
        Arc::new(FakeToolBridge { issues_json: issues_json(&[seven]), merged_branches: vec![merged_branch] });
    let client = Arc::new(RoleScriptedClient::new(vec![], vec![]));
    let dir = tempfile::tempdir().unwrap();
    let supervisor = build_supervisor(bridge, client.clone(), dir.path(), "run-s3");

    let summary = supervisor.execute(RunMode::Implement, None, false, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.completed_issues, vec![7]);
    assert_eq!(client.coding_calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.testing_calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.review_calls.load(Ordering::SeqCst), 0);

    let csv_contents = tokio::fs::read_to_string(dir.path().join("csv").join("issues.csv")).await.unwrap();
    assert!(csv_contents.contains("Skipped"), "expected a skipped row, got: {}", csv_contents);
}

/// S4: two queued issues; a `stop_system` arrives mid-Coding on issue 1.
/// Issue 1 is finalized as failed/canceled, issue 2 is never started, and a
/// later resume (against a cooperative client) drives issue 1 through to
/// completion from scratch.
#[tokio::test]
async fn s4_cancellation_mid_issue_then_resume_restarts_it() {
    let issues = vec![issue(1, "First", "", &[]), issue(2, "Second", "", &[])];
    let bridge: Arc<dyn ToolBridge> = Arc::new(FakeToolBridge { issues_json: issues_json(&issues), merged_branches: vec![] });
    let dir = tempfile::tempdir().unwrap();

    let ctx = CancellationToken::new();
    let canceling_client = Arc::new(CancelingClient { ctx: ctx.clone() });
    let supervisor = build_supervisor(bridge.clone(), canceling_client, dir.path(), "run-s4");

    let summary = supervisor.execute(RunMode::Implement, None, false, ctx).await.unwrap();
    assert!(summary.cancelled);
    assert!(summary.completed_issues.is_empty());
    assert_eq!(summary.failed_issues, vec![1]);

    let cooperative_client = Arc::new(RoleScriptedClient::new(vec![10, 20], vec![10, 20]));
    let resumed_supervisor = build_supervisor(bridge, cooperative_client, dir.path(), "run-s4");
    let resumed_summary =
        resumed_supervisor.execute(RunMode::Implement, None, true, CancellationToken::new()).await.unwrap();

    let mut completed = resumed_summary.completed_issues.clone();
    completed.sort();
    assert_eq!(completed, vec![1, 2]);
    assert!(!resumed_summary.cancelled);
}

/// S5: no `docs/ORCH_PLAN.json` is reachable (planning merge never lands a
/// `planning-structure` branch), so the supervisor falls back to
/// dependency/priority/iid ordering: #7 (priority::high) before #5 (the
/// dependency #3 needs) before #3.
#[tokio::test]
async fn s5_fallback_prioritization_orders_by_priority_then_dependency_then_iid() {
    let issues = vec![
        issue(3, "Dependent work", "Depends on #5", &[]),
        issue(5, "Base work", "", &[]),
        issue(7, "Other work", "", &["priority::high"]),
    ];
    let bridge: Arc<dyn ToolBridge> = Arc::new(FakeToolBridge { issues_json: issues_json(&issues), merged_branches: vec![] });
    let client = Arc::new(RoleScriptedClient::new(vec![1, 2, 3], vec![1, 2, 3]));
    let dir = tempfile::tempdir().unwrap();
    let supervisor = build_supervisor(bridge, client.clone(), dir.path(), "run-s5");

    let summary = supervisor.execute(RunMode::Implement, None, false, CancellationToken::new()).await.unwrap();

    let mut completed = summary.completed_issues.clone();
    completed.sort();
    assert_eq!(completed, vec![3, 5, 7]);
    assert_eq!(*client.coding_order.lock().await, vec![7, 5, 3]);
}

/// S6: a `--resume` started right after a clean completion is a no-op — the
/// checkpoint's `stage` is already `"completed"`, so no phase re-runs and the
/// prior run's completed/failed sets come back unchanged.
#[tokio::test]
async fn s6_resume_after_clean_completion_is_a_noop() {
    let issues = vec![issue(1, "Add /health", "", &[])];
    let bridge: Arc<dyn ToolBridge> = Arc::new(FakeToolBridge { issues_json: issues_json(&issues), merged_branches: vec![] });
    let dir = tempfile::tempdir().unwrap();

    let client = Arc::new(RoleScriptedClient::new(vec![1], vec![1]));
    let supervisor = build_supervisor(bridge.clone(), client, dir.path(), "run-s6");
    let first = supervisor.execute(RunMode::Implement, None, false, CancellationToken::new()).await.unwrap();
    assert_eq!(first.completed_issues, vec![1]);

    // A client that would fail the test if any phase actually ran.
    struct PanicsIfCalled;
    #[async_trait]
    impl ClientWrapper for PanicsIfCalled {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            panic!("no phase should run on a resume-after-completion no-op");
        }
        fn model_name(&self) -> &str {
            "panics"
        }
    }
    let resumed_supervisor = build_supervisor(bridge, Arc::new(PanicsIfCalled), dir.path(), "run-s6");
    let resumed =
        resumed_supervisor.execute(RunMode::Implement, None, true, CancellationToken::new()).await.unwrap();

    assert_eq!(resumed.completed_issues, vec![1]);
    assert!(resumed.failed_issues.is_empty());
    assert!(!resumed.cancelled);
}

/// S7: a checkpoint recorded mid-fleet, with issue 1 already marked failed
/// and a plan already computed, is honored on resume — issue 1 is not
/// retried (resume only continues issues in neither the completed nor the
/// failed set) and the restored plan is reused instead of recomputed.
#[tokio::test]
async fn s7_resume_honors_checkpointed_plan_and_failed_set() {
    let issues = vec![issue(1, "First", "", &[]), issue(2, "Second", "", &[])];
    let bridge: Arc<dyn ToolBridge> = Arc::new(FakeToolBridge { issues_json: issues_json(&issues), merged_branches: vec![] });
    let dir = tempfile::tempdir().unwrap();

    // A client whose Coding role fails issue 1's every attempt, so it lands
    // in `run_state.failed_issues` rather than being interrupted.
    struct FailsIssueOneClient;
    #[async_trait]
    impl ClientWrapper for FailsIssueOneClient {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            let system = messages[0].content.to_string();
            let instruction = messages.get(1).map(|m| m.content.to_string()).unwrap_or_default();
            let text = if system.contains("Planning agent") {
                "PLANNING_PHASE_COMPLETE".to_string()
            } else if system.contains("Coding agent") {
                let targets_issue_one = serde_json::from_str::<serde_json::Value>(&instruction)
                    .ok()
                    .and_then(|v| v["issues"][0].as_u64())
                    .map(|iid| iid == 1)
                    .unwrap_or(false);
                if targets_issue_one {
                    "CODING_PHASE_FAILED".to_string()
                } else {
                    "CODING_PHASE_COMPLETE".to_string()
                }
            } else if system.contains("Testing agent") {
                "TESTING_PHASE_COMPLETE pipeline #1".to_string()
            } else if system.contains("Review agent") {
                "REVIEW_PHASE_COMPLETE pipeline #1".to_string()
            } else {
                String::new()
            };
            Ok(Message { role: Role::Assistant, content: std::sync::Arc::from(text.as_str()), tool_calls: vec![] })
        }
        fn model_name(&self) -> &str {
            "fails-issue-one"
        }
    }

    let supervisor = build_supervisor(bridge.clone(), Arc::new(FailsIssueOneClient), dir.path(), "run-s7");
    let first = supervisor.execute(RunMode::Implement, None, false, CancellationToken::new()).await.unwrap();
    assert_eq!(first.completed_issues, vec![2]);
    assert_eq!(first.failed_issues, vec![1]);

    // A client that would fail the test if the Coding role ran again for
    // issue 1, proving resume skipped it rather than retrying.
    struct PanicsOnIssueOneCoding;
    #[async_trait]
    impl ClientWrapper for PanicsOnIssueOneCoding {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            let system = messages[0].content.to_string();
            if system.contains("Coding agent") {
                panic!("issue 1 is in the checkpoint's failed set and must not be retried");
            }
            let text = if system.contains("Planning agent") { "PLANNING_PHASE_COMPLETE" } else { "" };
            Ok(Message { role: Role::Assistant, content: std::sync::Arc::from(text), tool_calls: vec![] })
        }
        fn model_name(&self) -> &str {
            "panics-on-coding"
        }
    }
    let resumed_supervisor = build_supervisor(bridge, Arc::new(PanicsOnIssueOneCoding), dir.path(), "run-s7");
    let resumed =
        resumed_supervisor.execute(RunMode::Implement, None, true, CancellationToken::new()).await.unwrap();

    assert_eq!(resumed.completed_issues, vec![2]);
    assert_eq!(resumed.failed_issues, vec![1]);
}
