//! Job storage (§6.1): the external collaborator the runner depends on to
//! persist and queue jobs. A trait, so swapping the file-backed default for
//! a database-backed store later doesn't touch `job_runner.rs`.

use async_trait::async_trait;
use tandem_core::DataRoot;
use tandem_types::{Job, JobStatus};
use tokio::sync::Mutex;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()>;
    async fn claim_next(&self) -> anyhow::Result<Option<Job>>;
    async fn save(&self, job: &Job) -> anyhow::Result<()>;
    async fn load(&self, job_id: &str) -> anyhow::Result<Option<Job>>;
    async fn list(&self) -> anyhow::Result<Vec<Job>>;
}

/// Queues pending job ids in a FIFO file alongside each job's own
/// `job.json`; claiming pops the head of that file under a single lock so
/// two pollers never claim the same job.
pub struct FileJobStore {
    data_root: DataRoot,
    queue_lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(data_root: DataRoot) -> Self {
        Self {
            data_root,
            queue_lock: Mutex::new(()),
        }
    }

    fn job_file(&self, job_id: &str) -> std::path::PathBuf {
        self.data_root.job_dir(job_id).join("job.json")
    }

    fn queue_file(&self) -> std::path::PathBuf {
        self.data_root.root().join("jobs").join("pending.jsonl")
    }

    async fn read_queue(&self) -> Vec<String> {
        let path = self.queue_file();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn write_queue(&self, ids: &[String]) -> anyhow::Result<()> {
        let path = self.queue_file();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = ids.join("\n");
        tokio::fs::write(&path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        let _guard = self.queue_lock.lock().await;
        self.data_root.ensure_job_dir(&job.id).await?;
        let raw = serde_json::to_string_pretty(&job)?;
        tokio::fs::write(self.job_file(&job.id), raw).await?;

        let mut ids = self.read_queue().await;
        ids.push(job.id.clone());
        self.write_queue(&ids).await
    }

    async fn claim_next(&self) -> anyhow::Result<Option<Job>> {
        let _guard = self.queue_lock.lock().await;
        let mut ids = self.read_queue().await;
        if ids.is_empty() {
            return Ok(None);
        }
        let claimed_id = ids.remove(0);
        self.write_queue(&ids).await?;

        let raw = tokio::fs::read_to_string(self.job_file(&claimed_id)).await?;
        let mut job: Job = serde_json::from_str(&raw)?;
        job.status = JobStatus::Running;
        job.updated_at = chrono::Utc::now();
        let raw = serde_json::to_string_pretty(&job)?;
        tokio::fs::write(self.job_file(&claimed_id), raw).await?;
        Ok(Some(job))
    }

    async fn save(&self, job: &Job) -> anyhow::Result<()> {
        self.data_root.ensure_job_dir(&job.id).await?;
        let raw = serde_json::to_string_pretty(job)?;
        tokio::fs::write(self.job_file(&job.id), raw).await?;
        Ok(())
    }

    async fn load(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        match tokio::fs::read_to_string(self.job_file(job_id)).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> anyhow::Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for id in self.data_root.list_job_ids().await? {
            if let Some(job) = self.load(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_claim_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(DataRoot::new(dir.path()));
        let job = Job::new("do the thing", "proj-a");
        let job_id = job.id.clone();
        store.enqueue(job).await.unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Running);

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(DataRoot::new(dir.path()));
        let mut job = Job::new("do the thing", "proj-a");
        job.total_cost_usd = 1.5;
        store.save(&job).await.unwrap();

        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.total_cost_usd, 1.5);
    }

    #[tokio::test]
    async fn list_reflects_all_saved_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(DataRoot::new(dir.path()));
        store.save(&Job::new("a", "proj")).await.unwrap();
        store.save(&Job::new("b", "proj")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
