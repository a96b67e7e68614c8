//! Issue Manager (C5).
//!
//! Fetches open issues through the Tool Bridge, derives deterministic
//! feature-branch names, and is the sole authority on whether an issue is
//! already done (a merged MR against its feature branch, not the issue's
//! own `state`).

use crate::domain::{Issue, IssueRemoteState};
use crate::error::ToolBridgeError;
use crate::tool_bridge::ToolBridge;
use std::collections::{BTreeSet, HashSet};
use tokio::sync::Mutex;

/// Truncate a kebab-cased slug of an issue title to a bounded length so
/// `feature_branch` names stay reasonable for long titles.
const SLUG_MAX_LEN: usize = 40;

pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_was_dash = true; // suppress a leading dash
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
        if slug.len() >= SLUG_MAX_LEN {
            break;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("issue");
    }
    slug
}

/// Deterministic feature branch name, `feature/issue-<iid>-<slug>` (§3).
pub fn feature_branch(issue: &Issue) -> String {
    format!("feature/issue-{}-{}", issue.iid, slugify(&issue.title))
}

#[derive(Debug, Clone, serde::Deserialize)]
struct RemoteIssue {
    iid: u64,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct MergeRequestSummary {
    #[serde(default)]
    state: String,
}

pub struct IssueManager<'a> {
    bridge: &'a dyn ToolBridge,
    completed: Mutex<HashSet<u64>>,
    failed: Mutex<HashSet<u64>>,
}

impl<'a> IssueManager<'a> {
    pub fn new(bridge: &'a dyn ToolBridge) -> Self {
        IssueManager {
            bridge,
            completed: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }

    /// Calls `list_issues(projectID, state=opened)`, deduplicates by `iid`,
    /// and returns them in ascending `iid` order.
    pub async fn fetch_open_issues(&self, project_id: &str) -> Result<Vec<Issue>, ToolBridgeError> {
        let args = serde_json::json!({ "project_id": project_id, "state": "opened" });
        let raw = self.bridge.run_tool("list_issues", args).await?;
        let remote: Vec<RemoteIssue> = serde_json::from_str(&raw)
            .map_err(|e| ToolBridgeError::ToolError(format!("list_issues decode failed: {}", e)))?;

        let mut seen = BTreeSet::new();
        let mut issues = Vec::new();
        for r in remote {
            if !seen.insert(r.iid) {
                continue;
            }
            issues.push(Issue {
                iid: r.iid,
                title: r.title,
                description: r.description,
                state: if r.state == "closed" { IssueRemoteState::Closed } else { IssueRemoteState::Open },
                labels: r.labels.into_iter().collect(),
            });
        }
        issues.sort_by_key(|i| i.iid);
        Ok(issues)
    }

    /// The only authoritative completion check: true iff a merged MR exists
    /// with the issue's feature branch as source.
    pub async fn is_completed(&self, project_id: &str, issue: &Issue) -> Result<bool, ToolBridgeError> {
        let branch = feature_branch(issue);
        let args = serde_json::json!({
            "project_id": project_id,
            "source_branch": branch,
            "state": "merged",
        });
        let raw = self.bridge.run_tool("list_merge_requests", args).await?;
        let mrs: Vec<MergeRequestSummary> = serde_json::from_str(&raw)
            .map_err(|e| ToolBridgeError::ToolError(format!("list_merge_requests decode failed: {}", e)))?;
        Ok(!mrs.is_empty())
    }

    pub async fn track_completed(&self, issue: &Issue) {
        self.completed.lock().await.insert(issue.iid);
    }

    pub async fn track_failed(&self, issue: &Issue) {
        self.failed.lock().await.insert(issue.iid);
    }

    pub async fn completed_iids(&self) -> HashSet<u64> {
        self.completed.lock().await.clone()
    }

    pub async fn failed_iids(&self) -> HashSet<u64> {
        self.failed.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::planning_synthetic_issue;

    #[test]
    fn slugify_lowercases_and_dashes() {
        assert_eq!(slugify("Add /health endpoint"), "add-health-endpoint");
    }

    #[test]
    fn slugify_truncates_long_titles() {
        let long = "a".repeat(100);
        assert!(slugify(&long).len() <= SLUG_MAX_LEN);
    }

    #[test]
    fn feature_branch_is_deterministic() {
        let issue = Issue {
            iid: 7,
            title: "Add auth".to_string(),
            description: String::new(),
            state: IssueRemoteState::Open,
            labels: Default::default(),
        };
        let a = feature_branch(&issue);
        let b = feature_branch(&issue);
        assert_eq!(a, b);
        assert_eq!(a, "feature/issue-7-add-auth");
    }

    #[test]
    fn planning_synthetic_issue_has_fixed_title() {
        assert_eq!(planning_synthetic_issue().title, "Planning Structure Merge");
    }
}
