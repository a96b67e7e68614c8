//! Planning Manager (C6).
//!
//! Drives the Planning agent with retry, holds the raw planning text other
//! agents receive as context, loads `docs/ORCH_PLAN.json` from the remote
//! default branch, and reorders/filters the open-issue list for PHASE 3.

use crate::completion;
use crate::domain::{Issue, Plan};
use crate::error::ToolBridgeError;
use crate::tool_bridge::ToolBridge;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tokio::time::Duration;

const RETRY_DELAYS_SECS: [u64; 3] = [5, 10, 20];

pub struct PlanningManager {
    raw_plan: Mutex<Option<String>>,
    plan: Mutex<Option<Plan>>,
}

impl PlanningManager {
    pub fn new() -> Self {
        PlanningManager { raw_plan: Mutex::new(None), plan: Mutex::new(None) }
    }

    /// Invokes `run_fn` (which ultimately calls the Agent Runtime for the
    /// planning role) up to 3 times with 5s/10s/20s delays between
    /// attempts, stopping at the first attempt whose output passes
    /// Completion Markers for the planning role.
    pub async fn execute_planning_with_retry<F, Fut>(&self, mut run_fn: F, _apply: bool) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, String>>,
    {
        for (attempt, delay) in std::iter::once(0).chain(RETRY_DELAYS_SECS).enumerate() {
            if attempt > 0 {
                log::warn!("planning attempt {} failed, retrying in {}s", attempt, delay);
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            match run_fn().await {
                Ok(text) => {
                    let result = completion::check(completion::Role::Planning, &text);
                    self.store_plan(text).await;
                    if result.ok {
                        return true;
                    }
                    log::warn!("planning output failed completion check: {}", result.reason);
                }
                Err(e) => log::warn!("planning run_fn error: {}", e),
            }
        }
        false
    }

    pub async fn store_plan(&self, text: String) {
        *self.raw_plan.lock().await = Some(text);
    }

    pub async fn raw_plan(&self) -> Option<String> {
        self.raw_plan.lock().await.clone()
    }

    /// Fetches `docs/ORCH_PLAN.json` at `git_ref`, parses and validates it,
    /// and stores it on success.
    pub async fn load_plan_from_repo(
        &self,
        bridge: &dyn ToolBridge,
        project_id: &str,
        git_ref: &str,
    ) -> Result<bool, ToolBridgeError> {
        let args = serde_json::json!({
            "project_id": project_id,
            "file_path": "docs/ORCH_PLAN.json",
            "ref": git_ref,
        });
        let raw = match bridge.run_tool("get_file_contents", args).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("load_plan_from_repo: get_file_contents failed: {}", e);
                return Ok(false);
            }
        };
        let plan: Plan = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("load_plan_from_repo: invalid plan JSON: {}", e);
                return Ok(false);
            }
        };
        if let Err(e) = plan.validate() {
            log::warn!("load_plan_from_repo: plan failed validation: {}", e);
            return Ok(false);
        }
        *self.plan.lock().await = Some(plan);
        Ok(true)
    }

    pub async fn plan(&self) -> Option<Plan> {
        self.plan.lock().await.clone()
    }

    /// Reorders and filters `issues` per §4.6: plan order if valid,
    /// otherwise a dependency/priority-derived topological sort; then drops
    /// any issue `is_completed` already reports done.
    pub fn apply_prioritization(
        &self,
        issues: Vec<Issue>,
        plan: Option<&Plan>,
        is_completed: impl Fn(&Issue) -> bool,
    ) -> Vec<Issue> {
        let ordered = match plan {
            Some(plan) if !plan.implementation_order.is_empty() => order_by_plan(issues, plan),
            _ => order_by_dependencies_and_priority(issues),
        };
        ordered.into_iter().filter(|i| !is_completed(i)).collect()
    }
}

impl Default for PlanningManager {
    fn default() -> Self {
        Self::new()
    }
}

fn order_by_plan(issues: Vec<Issue>, plan: &Plan) -> Vec<Issue> {
    let mut by_iid: HashMap<u64, Issue> = issues.into_iter().map(|i| (i.iid, i)).collect();
    let mut ordered = Vec::new();
    for entry in &plan.implementation_order {
        if let Some(issue) = by_iid.remove(&entry.issue_id) {
            ordered.push(issue);
        }
    }
    let mut remaining: Vec<Issue> = by_iid.into_values().collect();
    remaining.sort_by_key(|i| i.iid);
    ordered.extend(remaining);
    ordered
}

fn dependency_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:depends on|requires)\s+#(\d+)").unwrap())
}

fn parse_dependencies(description: &str) -> HashSet<u64> {
    dependency_regex()
        .captures_iter(description)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u64>().ok()))
        .collect()
}

fn priority_rank(labels: &HashSet<String>) -> u8 {
    if labels.contains("priority::critical") {
        0
    } else if labels.contains("priority::high") {
        1
    } else if labels.contains("priority::medium") {
        2
    } else if labels.contains("priority::low") {
        3
    } else {
        4
    }
}

/// Topological sort by parsed "depends on #N"/"requires #N" phrases,
/// combined with `priority::*` labels and finally `iid`, all deterministic
/// for a fixed input (§8 invariant 8).
fn order_by_dependencies_and_priority(issues: Vec<Issue>) -> Vec<Issue> {
    let dependencies: HashMap<u64, HashSet<u64>> = issues
        .iter()
        .map(|i| (i.iid, parse_dependencies(&i.description)))
        .collect();
    let present: HashSet<u64> = issues.iter().map(|i| i.iid).collect();
    let mut by_iid: HashMap<u64, Issue> = issues.into_iter().map(|i| (i.iid, i)).collect();

    let mut remaining: Vec<u64> = by_iid.keys().copied().collect();
    let mut placed: HashSet<u64> = HashSet::new();
    let mut ordered = Vec::new();

    while !remaining.is_empty() {
        remaining.sort_by(|a, b| {
            let issue_a = &by_iid[a];
            let issue_b = &by_iid[b];
            priority_rank(&issue_a.labels)
                .cmp(&priority_rank(&issue_b.labels))
                .then(a.cmp(b))
        });

        let next = remaining.iter().copied().find(|iid| {
            dependencies
                .get(iid)
                .map(|deps| deps.iter().all(|d| !present.contains(d) || placed.contains(d)))
                .unwrap_or(true)
        });

        let chosen = match next {
            Some(iid) => iid,
            // Dependency cycle: fall back to priority/iid order for whatever's left.
            None => remaining[0],
        };

        remaining.retain(|iid| *iid != chosen);
        placed.insert(chosen);
        if let Some(issue) = by_iid.remove(&chosen) {
            ordered.push(issue);
        }
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IssueRemoteState;

    fn issue(iid: u64, description: &str, labels: &[&str]) -> Issue {
        Issue {
            iid,
            title: format!("Issue {}", iid),
            description: description.to_string(),
            state: IssueRemoteState::Open,
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn fallback_prioritization_orders_by_priority_then_dependency_then_iid() {
        // Mirrors S5: #3 "Depends on #5", #5 plain, #7 priority::high.
        let issues = vec![
            issue(3, "Depends on #5", &[]),
            issue(5, "base work", &[]),
            issue(7, "other work", &["priority::high"]),
        ];
        let ordered = order_by_dependencies_and_priority(issues);
        let iids: Vec<u64> = ordered.iter().map(|i| i.iid).collect();
        assert_eq!(iids, vec![7, 5, 3]);
    }

    #[test]
    fn plan_order_appends_unlisted_issues_by_iid() {
        let issues = vec![issue(1, "", &[]), issue(2, "", &[]), issue(3, "", &[])];
        let plan = Plan {
            implementation_order: vec![crate::domain::PlanEntry {
                issue_id: 2,
                priority: None,
                dependencies: Default::default(),
            }],
            tech_stack: Default::default(),
            architecture: serde_json::Value::Null,
        };
        let ordered = order_by_plan(issues, &plan);
        let iids: Vec<u64> = ordered.iter().map(|i| i.iid).collect();
        assert_eq!(iids, vec![2, 1, 3]);
    }

    #[test]
    fn apply_prioritization_filters_completed_issues() {
        let manager = PlanningManager::new();
        let issues = vec![issue(1, "", &[]), issue(2, "", &[])];
        let result = manager.apply_prioritization(issues, None, |i| i.iid == 1);
        let iids: Vec<u64> = result.iter().map(|i| i.iid).collect();
        assert_eq!(iids, vec![2]);
    }

    #[test]
    fn dependency_cycle_does_not_infinite_loop() {
        let issues = vec![issue(1, "Depends on #2", &[]), issue(2, "Depends on #1", &[])];
        let ordered = order_by_dependencies_and_priority(issues);
        assert_eq!(ordered.len(), 2);
    }
}
