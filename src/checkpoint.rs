//! Checkpoint Manager (C7).
//!
//! Persists [`RunState`] to `logs/runs/<runID>/checkpoints/latest.json` via
//! an atomic temp-file-then-rename write so a crash mid-write never leaves
//! a truncated checkpoint behind.

use crate::domain::RunState;
use std::path::PathBuf;

pub struct CheckpointManager {
    run_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(logs_root: impl Into<PathBuf>, run_id: &str) -> Self {
        CheckpointManager { run_dir: logs_root.into().join("runs").join(run_id) }
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.run_dir.join("checkpoints").join("latest.json")
    }

    /// Atomic write: serialize to a sibling temp file, fsync it, then
    /// rename over the final path so readers never observe a partial file.
    pub async fn save(&self, state: &RunState) -> std::io::Result<()> {
        let dir = self.checkpoint_path().parent().unwrap().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let final_path = self.checkpoint_path();
        let tmp_path = dir.join("latest.json.tmp");

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path).await?;
        log::info!("checkpoint saved: stage={}", state.stage);
        Ok(())
    }

    /// Reads and validates the latest checkpoint. Missing file returns
    /// `Ok(None)`, not an error.
    pub async fn load(&self) -> std::io::Result<Option<RunState>> {
        let path = self.checkpoint_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let state: RunState = serde_json::from_str(&contents)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(self.checkpoint_path()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "run-1");
        let mut state = RunState::new("run-1".to_string(), "proj".to_string());
        state.completed_issues.insert(1);
        state.stage = "after_issue_1_completed".to_string();

        manager.save(&state).await.unwrap();
        let loaded = manager.load().await.unwrap().unwrap();

        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.completed_issues, state.completed_issues);
        assert_eq!(loaded.stage, state.stage);
    }

    #[tokio::test]
    async fn load_with_no_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "run-1");
        assert!(manager.load().await.unwrap().is_none());
        assert!(!manager.exists().await);
    }

    #[tokio::test]
    async fn exists_is_true_after_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "run-1");
        let state = RunState::new("run-1".to_string(), "proj".to_string());
        manager.save(&state).await.unwrap();
        assert!(manager.exists().await);
    }
}
