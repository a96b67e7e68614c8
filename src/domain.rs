//! Shared data model (§3): issues, plans, pipeline attempts, checkpointed
//! run/issue state, and WebSocket connection bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// An open issue fetched from the remote tool bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub iid: u64,
    pub title: String,
    pub description: String,
    pub state: IssueRemoteState,
    pub labels: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueRemoteState {
    Open,
    Closed,
}

/// The synthetic issue used for the planning-merge review invocation
/// (§4.8 "Special planning-merge invocation").
pub fn planning_synthetic_issue() -> Issue {
    Issue {
        iid: 0,
        title: "Planning Structure Merge".to_string(),
        description: String::new(),
        state: IssueRemoteState::Open,
        labels: HashSet::new(),
    }
}

/// One entry in a [`Plan`]'s implementation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    #[serde(rename = "issueID")]
    pub issue_id: u64,
    pub priority: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TechStack {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub frontend: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub testing: Option<String>,
}

/// Structured plan document, `docs/ORCH_PLAN.json` (§3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "implementationOrder")]
    pub implementation_order: Vec<PlanEntry>,
    #[serde(rename = "techStack", default)]
    pub tech_stack: TechStack,
    #[serde(default)]
    pub architecture: serde_json::Value,
}

impl Plan {
    /// Validate the invariants from §3: no duplicate issue IDs, and the
    /// dependency graph is a DAG for which `implementation_order` is a
    /// topological sort.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for entry in &self.implementation_order {
            if !seen.insert(entry.issue_id) {
                return Err(format!("duplicate issueID {} in implementationOrder", entry.issue_id));
            }
        }
        let position: std::collections::HashMap<u64, usize> = self
            .implementation_order
            .iter()
            .enumerate()
            .map(|(i, e)| (e.issue_id, i))
            .collect();
        for entry in &self.implementation_order {
            let here = position[&entry.issue_id];
            for dep in &entry.dependencies {
                if let Some(&dep_pos) = position.get(dep) {
                    if dep_pos > here {
                        return Err(format!(
                            "issue {} listed before its dependency {}",
                            entry.issue_id, dep
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub name: String,
    pub status: PipelineStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineAttempt {
    #[serde(rename = "pipelineID")]
    pub pipeline_id: i64,
    pub branch: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub status: PipelineStatus,
    pub jobs: Vec<PipelineJob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Coding,
    Testing,
    Review,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseAttempts {
    pub count: u32,
    pub successes: u32,
    pub failures: u32,
    /// Wall-clock duration of each attempt, in milliseconds.
    pub durations_ms: Vec<u64>,
}

/// Per-issue tracker state (§3 `IssueState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueState {
    pub iid: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub attempts: std::collections::HashMap<Phase, PhaseAttempts>,
    pub pipeline_attempts: Vec<PipelineAttempt>,
    pub errors: Vec<String>,
    pub status: IssueStatus,
}

impl IssueState {
    pub fn new(iid: u64) -> Self {
        IssueState {
            iid,
            started_at: chrono::Utc::now(),
            attempts: std::collections::HashMap::new(),
            pipeline_attempts: Vec::new(),
            errors: Vec::new(),
            status: IssueStatus::InProgress,
        }
    }

    pub fn record_attempt(&mut self, phase: Phase, success: bool, duration_ms: u64) {
        let entry = self.attempts.entry(phase).or_default();
        entry.count += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.durations_ms.push(duration_ms);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub successes: u64,
    pub errors: u64,
    pub agent_calls: u64,
    pub tool_calls: u64,
}

/// Checkpointed supervisor state (§3 `RunState`, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub project_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_issues: BTreeSet<u64>,
    pub failed_issues: BTreeSet<u64>,
    pub plan: Option<Plan>,
    pub stage: String,
    pub metrics: RunMetrics,
}

impl RunState {
    pub fn new(run_id: String, project_id: String) -> Self {
        RunState {
            run_id,
            project_id,
            started_at: chrono::Utc::now(),
            completed_issues: BTreeSet::new(),
            failed_issues: BTreeSet::new(),
            plan: None,
            stage: "initializing".to_string(),
            metrics: RunMetrics::default(),
        }
    }
}

/// One live WebSocket client (§3 `ConnectionInfo`).
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: uuid::Uuid,
    pub accepted_at: chrono::DateTime<chrono::Utc>,
    pub last_ping_sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_activity_at: chrono::DateTime<chrono::Utc>,
}

impl ConnectionInfo {
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        ConnectionInfo {
            connection_id: uuid::Uuid::new_v4(),
            accepted_at: now,
            last_ping_sent_at: None,
            last_activity_at: now,
        }
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_validate_rejects_duplicate_issue_ids() {
        let plan = Plan {
            implementation_order: vec![
                PlanEntry { issue_id: 1, priority: None, dependencies: BTreeSet::new() },
                PlanEntry { issue_id: 1, priority: None, dependencies: BTreeSet::new() },
            ],
            tech_stack: TechStack::default(),
            architecture: serde_json::Value::Null,
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_validate_rejects_dependency_listed_after_dependent() {
        let mut deps = BTreeSet::new();
        deps.insert(2);
        let plan = Plan {
            implementation_order: vec![
                PlanEntry { issue_id: 1, priority: None, dependencies: deps },
                PlanEntry { issue_id: 2, priority: None, dependencies: BTreeSet::new() },
            ],
            tech_stack: TechStack::default(),
            architecture: serde_json::Value::Null,
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_validate_accepts_valid_topological_order() {
        let mut deps = BTreeSet::new();
        deps.insert(1);
        let plan = Plan {
            implementation_order: vec![
                PlanEntry { issue_id: 1, priority: None, dependencies: BTreeSet::new() },
                PlanEntry { issue_id: 2, priority: None, dependencies: deps },
            ],
            tech_stack: TechStack::default(),
            architecture: serde_json::Value::Null,
        };
        assert!(plan.validate().is_ok());
    }
}
