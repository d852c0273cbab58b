//! Resolves the persisted-state layout under the orchestrator's data root,
//! replacing the teacher's `storage_paths` helper (which resolved a chat
//! session tree) with the job/event/cost tree this system persists.
//!
//! Layout:
//! ```text
//! <data_root>/
//!   events/gateway.log
//!   events/alerts.jsonl
//!   events/circuit_breakers.json
//!   costs/costs.jsonl
//!   jobs/runs/<job_id>/progress.json
//!   jobs/runs/<job_id>/plan.json
//!   jobs/runs/<job_id>/<phase>.jsonl
//!   jobs/runs/<job_id>/result.json
//!   jobs/runs/<job_id>/recovery.jsonl
//!   workflows/runs/<workflow_id>/execution.json
//! ```

use std::path::{Path, PathBuf};

use tandem_types::Phase;
use tokio::fs;

#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn gateway_log(&self) -> PathBuf {
        self.root.join("events").join("gateway.log")
    }

    pub fn alerts_log(&self) -> PathBuf {
        self.root.join("events").join("alerts.jsonl")
    }

    pub fn circuit_breakers_file(&self) -> PathBuf {
        self.root.join("events").join("circuit_breakers.json")
    }

    pub fn costs_log(&self) -> PathBuf {
        self.root.join("costs").join("costs.jsonl")
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join("runs").join(job_id)
    }

    pub fn progress_file(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("progress.json")
    }

    pub fn plan_file(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("plan.json")
    }

    pub fn phase_log(&self, job_id: &str, phase: Phase) -> PathBuf {
        self.job_dir(job_id).join(format!("{}.jsonl", phase.as_str()))
    }

    pub fn result_file(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("result.json")
    }

    pub fn recovery_log(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("recovery.jsonl")
    }

    pub fn workflow_dir(&self, workflow_id: &str) -> PathBuf {
        self.root.join("workflows").join("runs").join(workflow_id)
    }

    pub fn workflow_execution_file(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("execution.json")
    }

    pub async fn ensure_workflow_dir(&self, workflow_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.workflow_dir(workflow_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Creates every directory this layout needs, idempotently.
    pub async fn ensure_layout(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.root.join("events")).await?;
        fs::create_dir_all(self.root.join("costs")).await?;
        fs::create_dir_all(self.root.join("jobs").join("runs")).await?;
        fs::create_dir_all(self.root.join("workflows").join("runs")).await?;
        Ok(())
    }

    pub async fn ensure_job_dir(&self, job_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// All job ids with a run directory under `jobs/runs`.
    pub async fn list_job_ids(&self) -> std::io::Result<Vec<String>> {
        let runs_dir = self.root.join("jobs").join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&runs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn layout_creates_expected_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        root.ensure_layout().await.unwrap();
        assert!(dir.path().join("events").is_dir());
        assert!(dir.path().join("costs").is_dir());
        assert!(dir.path().join("jobs").join("runs").is_dir());
    }

    #[tokio::test]
    async fn job_dir_paths_are_scoped_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        root.ensure_job_dir("job-1").await.unwrap();
        assert_eq!(
            root.progress_file("job-1"),
            dir.path().join("jobs/runs/job-1/progress.json")
        );
        assert_eq!(
            root.phase_log("job-1", Phase::Plan),
            dir.path().join("jobs/runs/job-1/plan.jsonl")
        );
    }

    #[tokio::test]
    async fn list_job_ids_reflects_created_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        root.ensure_job_dir("job-a").await.unwrap();
        root.ensure_job_dir("job-b").await.unwrap();
        let mut ids = root.list_job_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["job-a".to_string(), "job-b".to_string()]);
    }
}
