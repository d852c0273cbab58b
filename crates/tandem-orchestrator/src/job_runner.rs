//! Job runner (C10), ported from `autonomous_runner.py::AutonomousRunner`.
//! Polls the job store for pending work, bounds concurrency with a
//! semaphore, and drives each claimed job through the five-phase pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tandem_core::{DataRoot, OrchestratorConfig};
use tandem_providers::{AppConfig, CooldownTracker, ProviderRegistry};
use tandem_tools::ToolRegistry;
use tandem_types::{Job, JobStatus};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreaker;
use crate::cost_ledger::CostLedger;
use crate::intent_router::IntentRouter;
use crate::job_store::JobStore;
use crate::pipeline::{self, PipelineOutcome};
use crate::tool_loop::ToolLoop;

/// How long a graceful `stop()` waits for in-flight pipelines before
/// force-cancelling the survivors.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(120);

/// Candidate chains are injected once at startup rather than re-derived per
/// call, matching the "explicitly-owned singletons" shape the providers and
/// tools registries already follow.
#[derive(Debug, Clone)]
pub struct ProviderChains {
    pub tool_executor: Vec<String>,
    pub text_reasoner: Vec<String>,
}

pub struct JobRunnerStats {
    pub total_started: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_budget_exceeded: u64,
    pub total_cancelled: u64,
}

impl Default for JobRunnerStats {
    fn default() -> Self {
        Self {
            total_started: 0,
            total_succeeded: 0,
            total_failed: 0,
            total_budget_exceeded: 0,
            total_cancelled: 0,
        }
    }
}

pub struct JobRunner {
    config: OrchestratorConfig,
    data_root: DataRoot,
    store: Arc<dyn JobStore>,
    providers: Arc<ProviderRegistry>,
    cooldowns: Arc<CooldownTracker>,
    cost_ledger: Arc<CostLedger>,
    circuit_breaker: Arc<CircuitBreaker>,
    tools: Arc<ToolRegistry>,
    intent_router: Arc<IntentRouter>,
    chains: ProviderChains,
    semaphore: Arc<Semaphore>,
    active_jobs: Arc<RwLock<HashMap<String, CancellationToken>>>,
    stats: Arc<Mutex<JobRunnerStats>>,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub async fn new(
        config: OrchestratorConfig,
        provider_config: AppConfig,
        store: Arc<dyn JobStore>,
        chains: ProviderChains,
    ) -> Self {
        let data_root = DataRoot::new(config.data_root.clone());
        let _ = data_root.ensure_layout().await;

        Self {
            providers: Arc::new(ProviderRegistry::new(provider_config)),
            cooldowns: Arc::new(CooldownTracker::new()),
            cost_ledger: Arc::new(CostLedger::new(data_root.costs_log())),
            circuit_breaker: Arc::new(CircuitBreaker::load(data_root.circuit_breakers_file()).await),
            tools: Arc::new(ToolRegistry::new()),
            intent_router: Arc::new(IntentRouter::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            active_jobs: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(Mutex::new(JobRunnerStats::default())),
            shutdown: CancellationToken::new(),
            data_root,
            store,
            chains,
            config,
        }
    }

    /// Submits a new job to the store's pending queue. Does not block on
    /// execution; the poll loop picks it up on its next tick.
    pub async fn submit(&self, task: impl Into<String>, project: impl Into<String>) -> anyhow::Result<Job> {
        let job = Job::new(task, project);
        self.store.enqueue(job.clone()).await?;
        Ok(job)
    }

    pub async fn get_progress(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        self.store.load(job_id).await
    }

    /// Cancels a running job cooperatively: the pipeline checks the token
    /// between phases, not mid-call. Marks the job `cancelled` in the store
    /// and drops it from the active set immediately, rather than waiting for
    /// the pipeline to notice. Idempotent: a second call on an already
    /// cancelled job still returns `true`.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let token = self.active_jobs.write().await.remove(job_id);
        if let Some(token) = token {
            token.cancel();
            if let Ok(Some(mut job)) = self.store.load(job_id).await {
                job.status = JobStatus::Cancelled;
                job.updated_at = chrono::Utc::now();
                let _ = self.store.save(&job).await;
            }
            return true;
        }
        matches!(self.store.load(job_id).await, Ok(Some(job)) if job.status == JobStatus::Cancelled)
    }

    pub async fn active_job_ids(&self) -> Vec<String> {
        self.active_jobs.read().await.keys().cloned().collect()
    }

    pub async fn stats_snapshot(&self) -> (u64, u64, u64, u64, u64) {
        let stats = self.stats.lock().await;
        (
            stats.total_started,
            stats.total_succeeded,
            stats.total_failed,
            stats.total_budget_exceeded,
            stats.total_cancelled,
        )
    }

    /// Runs the poll loop until `stop()` is called. Each tick claims at most
    /// one job per free semaphore permit and spawns it as a detached task.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.poll_interval_s));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.clone().poll_once().await;
                }
            }
        }
    }

    /// Cancels the poll loop, then waits up to `GRACEFUL_STOP_TIMEOUT` for
    /// in-flight pipelines to finish on their own; any still running past
    /// the deadline are force-cancelled.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + GRACEFUL_STOP_TIMEOUT;
        while !self.active_jobs.read().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let survivors: Vec<CancellationToken> = self.active_jobs.read().await.values().cloned().collect();
        for token in survivors {
            token.cancel();
        }
    }

    async fn poll_once(self: Arc<Self>) {
        while let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            let job = match self.store.claim_next().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to claim next job");
                    drop(permit);
                    break;
                }
            };

            let runner = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                runner.execute_job(job).await;
            });
        }
    }

    async fn execute_job(&self, mut job: Job) {
        let token = CancellationToken::new();
        self.active_jobs.write().await.insert(job.id.clone(), token.clone());
        {
            let mut stats = self.stats.lock().await;
            stats.total_started += 1;
        }

        let tool_loop = ToolLoop {
            providers: &self.providers,
            cooldowns: &self.cooldowns,
            cost_ledger: &self.cost_ledger,
            tools: &self.tools,
            tool_executor_chain: &self.chains.tool_executor,
            text_reasoner_chain: &self.chains.text_reasoner,
        };

        let outcome = pipeline::run(
            &job,
            &self.data_root,
            &tool_loop,
            &self.intent_router,
            &self.circuit_breaker,
            self.config.budget_limit_usd,
            token,
        )
        .await;

        let _ = self.circuit_breaker.persist().await;
        self.active_jobs.write().await.remove(&job.id);

        job.status = match &outcome {
            PipelineOutcome::Success { total_cost_usd, .. } => {
                job.total_cost_usd = *total_cost_usd;
                job.completed_at = Some(chrono::Utc::now());
                JobStatus::Done
            }
            PipelineOutcome::BudgetExceeded { .. } => {
                job.error = Some("budget exceeded".to_string());
                JobStatus::Failed
            }
            PipelineOutcome::Cancelled => JobStatus::Cancelled,
            PipelineOutcome::Failed { phase, reason } => {
                job.error = Some(format!("{phase}: {reason}"));
                JobStatus::Failed
            }
        };
        job.updated_at = chrono::Utc::now();
        if let Err(err) = self.store.save(&job).await {
            tracing::error!(job_id = %job.id, error = %err, "failed to persist job after pipeline run");
        }

        let mut stats = self.stats.lock().await;
        match outcome {
            PipelineOutcome::Success { .. } => stats.total_succeeded += 1,
            PipelineOutcome::BudgetExceeded { .. } => stats.total_budget_exceeded += 1,
            PipelineOutcome::Cancelled => stats.total_cancelled += 1,
            PipelineOutcome::Failed { .. } => stats.total_failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::FileJobStore;

    #[tokio::test]
    async fn submit_enqueues_a_pending_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.data_root = dir.path().to_path_buf();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(DataRoot::new(dir.path())));
        let runner = JobRunner::new(
            config,
            AppConfig::default(),
            store.clone(),
            ProviderChains {
                tool_executor: vec!["local-echo".to_string()],
                text_reasoner: vec!["local-echo".to_string()],
            },
        )
        .await;

        let job = runner.submit("do a thing", "proj-a").await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.data_root = dir.path().to_path_buf();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(DataRoot::new(dir.path())));
        let runner = JobRunner::new(
            config,
            AppConfig::default(),
            store,
            ProviderChains {
                tool_executor: vec![],
                text_reasoner: vec![],
            },
        )
        .await;
        assert!(!runner.cancel_job("does-not-exist").await);
    }

    #[tokio::test]
    async fn cancel_active_job_marks_store_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.data_root = dir.path().to_path_buf();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(DataRoot::new(dir.path())));
        let runner = JobRunner::new(
            config,
            AppConfig::default(),
            store.clone(),
            ProviderChains {
                tool_executor: vec![],
                text_reasoner: vec![],
            },
        )
        .await;

        let job = Job::new("do a thing", "proj-a");
        store.save(&job).await.unwrap();
        let token = CancellationToken::new();
        runner.active_jobs.write().await.insert(job.id.clone(), token.clone());

        assert!(runner.cancel_job(&job.id).await);
        assert!(token.is_cancelled());
        assert!(!runner.active_jobs.read().await.contains_key(&job.id));
        let reloaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Cancelled);

        // Idempotent: the second call finds no active entry but the store
        // already shows `cancelled`, so it reports the same outcome.
        assert!(runner.cancel_job(&job.id).await);
    }
}
