//! Run/Issue Trackers + CSV Exporter (C10).
//!
//! Run-level counters are plain atomics since the agent output callback may
//! fire from arbitrary tasks (§5 "Tracker metrics are updated via atomic
//! counters where contention is possible"). Per-issue reports and the two
//! append-only CSV files use stable column orderings so downstream tooling
//! can parse them without a schema.

use crate::domain::{IssueState, RunState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(serde::Serialize)]
struct RunRow<'a> {
    run_id: &'a str,
    project_id: &'a str,
    stage: &'a str,
    completed_issues: usize,
    failed_issues: usize,
    successes: u64,
    errors: u64,
    agent_calls: u64,
    tool_calls: u64,
    duration_secs: u64,
}

#[derive(serde::Serialize)]
struct IssueRow<'a> {
    run_id: &'a str,
    iid: u64,
    status: String,
    errors: usize,
    coding_attempts: u32,
    testing_attempts: u32,
    review_attempts: u32,
}

#[derive(Default)]
pub struct RunTracker {
    pub successes: AtomicU64,
    pub errors: AtomicU64,
    pub agent_calls: AtomicU64,
    pub tool_calls: AtomicU64,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_agent_call(&self) {
        self.agent_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_call(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> crate::domain::RunMetrics {
        crate::domain::RunMetrics {
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            agent_calls: self.agent_calls.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
        }
    }
}

pub struct CsvExporter {
    logs_root: PathBuf,
}

impl CsvExporter {
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        CsvExporter { logs_root: logs_root.into() }
    }

    async fn ensure_dir(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Appends one row to `logs/csv/runs.csv`, writing the header first if
    /// the file does not yet exist.
    pub async fn append_run_row(&self, state: &RunState, duration: Duration) -> std::io::Result<()> {
        let path = self.logs_root.join("csv").join("runs.csv");
        Self::ensure_dir(&path).await?;
        let write_header = tokio::fs::metadata(&path).await.is_err();

        let row = RunRow {
            run_id: &state.run_id,
            project_id: &state.project_id,
            stage: &state.stage,
            completed_issues: state.completed_issues.len(),
            failed_issues: state.failed_issues.len(),
            successes: state.metrics.successes,
            errors: state.metrics.errors,
            agent_calls: state.metrics.agent_calls,
            tool_calls: state.metrics.tool_calls,
            duration_secs: duration.as_secs(),
        };
        Self::append_csv_row(&path, write_header, &row).await
    }

    /// Appends one row to `logs/csv/issues.csv`.
    pub async fn append_issue_row(&self, run_id: &str, issue_state: &IssueState) -> std::io::Result<()> {
        let path = self.logs_root.join("csv").join("issues.csv");
        Self::ensure_dir(&path).await?;
        let write_header = tokio::fs::metadata(&path).await.is_err();

        let attempts = |phase: crate::domain::Phase| {
            issue_state.attempts.get(&phase).map(|a| a.count).unwrap_or(0)
        };
        let row = IssueRow {
            run_id,
            iid: issue_state.iid,
            status: format!("{:?}", issue_state.status),
            errors: issue_state.errors.len(),
            coding_attempts: attempts(crate::domain::Phase::Coding),
            testing_attempts: attempts(crate::domain::Phase::Testing),
            review_attempts: attempts(crate::domain::Phase::Review),
        };
        Self::append_csv_row(&path, write_header, &row).await
    }

    /// Serializes one row with the `csv` crate and appends it to `path`.
    /// Runs on a blocking thread since `csv::Writer` is a synchronous API.
    async fn append_csv_row<T>(path: &Path, write_header: bool, row: &T) -> std::io::Result<()>
    where
        T: serde::Serialize,
    {
        let mut buf = Vec::new();
        {
            let mut writer = csv::WriterBuilder::new().has_headers(write_header).from_writer(&mut buf);
            writer
                .serialize(row)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writer.flush()?;
        }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(&buf).await?;
        Ok(())
    }

    /// Writes the per-issue JSON report on finalization,
    /// `logs/runs/<runID>/issues/issue_<iid>_report.json`.
    pub async fn write_issue_report(&self, run_id: &str, issue_state: &IssueState) -> std::io::Result<()> {
        let path = self
            .logs_root
            .join("runs")
            .join(run_id)
            .join("issues")
            .join(format!("issue_{}_report.json", issue_state.iid));
        Self::ensure_dir(&path).await?;
        let json = serde_json::to_string_pretty(issue_state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&path, json).await
    }

    /// Writes an in-progress snapshot of an issue's attempt counters,
    /// `logs/runs/<runID>/issues/issue_<iid>_metrics.json`. Overwritten on
    /// every phase attempt so a concurrent reader sees live progress rather
    /// than only the finalize-time report.
    pub async fn write_issue_metrics(&self, run_id: &str, issue_state: &IssueState) -> std::io::Result<()> {
        let path = self
            .logs_root
            .join("runs")
            .join(run_id)
            .join("issues")
            .join(format!("issue_{}_metrics.json", issue_state.iid));
        Self::ensure_dir(&path).await?;
        let json = serde_json::to_string_pretty(issue_state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&path, json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IssueState;

    #[test]
    fn run_tracker_counters_accumulate() {
        let tracker = RunTracker::new();
        tracker.record_agent_call();
        tracker.record_agent_call();
        tracker.record_tool_call();
        tracker.record_success();
        tracker.record_error();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.agent_calls, 2);
        assert_eq!(snapshot.tool_calls, 1);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.errors, 1);
    }

    #[tokio::test]
    async fn csv_exporter_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path());
        let state = RunState::new("run-1".to_string(), "proj".to_string());
        exporter.append_run_row(&state, Duration::from_secs(5)).await.unwrap();
        exporter.append_run_row(&state, Duration::from_secs(6)).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("csv").join("runs.csv")).await.unwrap();
        assert_eq!(contents.lines().count(), 3); // header + 2 rows
    }

    #[tokio::test]
    async fn issue_report_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path());
        let issue_state = IssueState::new(42);
        exporter.write_issue_report("run-1", &issue_state).await.unwrap();
        let path = dir.path().join("runs").join("run-1").join("issues").join("issue_42_report.json");
        let contents = tokio::fs::read_to_string(path).await.unwrap();
        let parsed: IssueState = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.iid, 42);
    }
}
