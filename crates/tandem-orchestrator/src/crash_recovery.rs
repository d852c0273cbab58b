//! Crash recovery (C11), ported from `autonomous_runner.py`'s startup
//! recovery sweep. Jobs whose `progress.json` shows them `running` but
//! hasn't been touched within the freshness window are assumed to have been
//! orphaned by a crash and are re-queued as pending; a recovery event is
//! appended for each one.

use chrono::{Duration as ChronoDuration, Utc};
use tandem_core::DataRoot;
use tandem_types::{JobStatus, PhaseStatus, ProgressRecord};
use tokio::io::AsyncWriteExt;

use crate::job_store::JobStore;

#[derive(Debug, Clone, serde::Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<String>,
    pub unrecoverable: Vec<String>,
}

/// Scans every job's `progress.json` under `data_root`, re-queuing stale
/// `running` jobs via `store` and logging each decision. Progress records
/// that fail to parse are reported in `unrecoverable` and left untouched.
pub async fn recover_stale_jobs(
    data_root: &DataRoot,
    store: &dyn JobStore,
    freshness_window_s: i64,
) -> anyhow::Result<RecoveryReport> {
    let freshness_window = ChronoDuration::seconds(freshness_window_s);
    let now = Utc::now();
    let mut report = RecoveryReport {
        recovered: Vec::new(),
        unrecoverable: Vec::new(),
    };

    for job_id in data_root.list_job_ids().await? {
        let progress_path = data_root.progress_file(&job_id);
        let raw = match tokio::fs::read_to_string(&progress_path).await {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        let progress: ProgressRecord = match serde_json::from_str(&raw) {
            Ok(progress) => progress,
            Err(_) => {
                report.unrecoverable.push(job_id.clone());
                log_recovery_event(data_root, &job_id, "unparseable_progress").await;
                continue;
            }
        };

        if progress.phase_status != PhaseStatus::Running {
            continue;
        }
        if !progress.is_stale(freshness_window, now) {
            continue;
        }

        match store.load(&job_id).await {
            Ok(Some(mut job)) => {
                job.status = JobStatus::Pending;
                job.updated_at = now;
                let mut stale_progress = progress.clone();
                stale_progress.phase_status = PhaseStatus::Failed;
                stale_progress.error = Some(format!("interrupted during {}", progress.phase.as_str()));
                stale_progress.updated_at = now;
                let progress_written = tokio::fs::write(
                    &progress_path,
                    serde_json::to_string(&stale_progress).unwrap_or_default(),
                )
                .await
                .is_ok();

                if progress_written && store.save(&job).await.is_ok() && store.enqueue(job).await.is_ok() {
                    report.recovered.push(job_id.clone());
                    log_recovery_event(data_root, &job_id, "requeued_stale_job").await;
                } else {
                    report.unrecoverable.push(job_id.clone());
                    log_recovery_event(data_root, &job_id, "requeue_failed").await;
                }
            }
            _ => {
                report.unrecoverable.push(job_id.clone());
                log_recovery_event(data_root, &job_id, "job_record_missing").await;
            }
        }
    }

    Ok(report)
}

async fn log_recovery_event(data_root: &DataRoot, job_id: &str, event: &str) {
    let path = data_root.recovery_log(job_id);
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let line = serde_json::json!({"job_id": job_id, "event": event, "at": Utc::now()}).to_string();
    if let Ok(mut file) = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
        let _ = file.write_all(format!("{line}\n").as_bytes()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::FileJobStore;
    use tandem_types::{Job, Phase};

    #[tokio::test]
    async fn stale_running_job_is_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        data_root.ensure_layout().await.unwrap();
        let store = FileJobStore::new(DataRoot::new(dir.path()));

        let job = Job::new("do the thing", "proj-a");
        store.save(&job).await.unwrap();

        let mut progress = ProgressRecord::new(job.id.clone());
        progress.phase = Phase::Execute;
        progress.phase_status = PhaseStatus::Running;
        progress.updated_at = Utc::now() - ChronoDuration::seconds(600);
        data_root.ensure_job_dir(&job.id).await.unwrap();
        tokio::fs::write(data_root.progress_file(&job.id), serde_json::to_string(&progress).unwrap())
            .await
            .unwrap();

        let report = recover_stale_jobs(&data_root, &store, 60).await.unwrap();
        assert_eq!(report.recovered, vec![job.id.clone()]);

        let reloaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Pending);

        let raw = tokio::fs::read_to_string(data_root.progress_file(&job.id)).await.unwrap();
        let rewritten: ProgressRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(rewritten.phase_status, PhaseStatus::Failed);
        assert_eq!(rewritten.error.as_deref(), Some("interrupted during execute"));
    }

    #[tokio::test]
    async fn fresh_running_job_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        data_root.ensure_layout().await.unwrap();
        let store = FileJobStore::new(DataRoot::new(dir.path()));

        let job = Job::new("do the thing", "proj-a");
        store.save(&job).await.unwrap();

        let mut progress = ProgressRecord::new(job.id.clone());
        progress.phase_status = PhaseStatus::Running;
        data_root.ensure_job_dir(&job.id).await.unwrap();
        tokio::fs::write(data_root.progress_file(&job.id), serde_json::to_string(&progress).unwrap())
            .await
            .unwrap();

        let report = recover_stale_jobs(&data_root, &store, 60).await.unwrap();
        assert!(report.recovered.is_empty());
    }

    #[tokio::test]
    async fn unparseable_progress_is_reported_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        data_root.ensure_layout().await.unwrap();
        let store = FileJobStore::new(DataRoot::new(dir.path()));

        data_root.ensure_job_dir("job-x").await.unwrap();
        tokio::fs::write(data_root.progress_file("job-x"), "not json").await.unwrap();

        let report = recover_stale_jobs(&data_root, &store, 60).await.unwrap();
        assert_eq!(report.unrecoverable, vec!["job-x".to_string()]);
    }
}
