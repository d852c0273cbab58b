//! Per-agent circuit breaker (C3), ported from `error_recovery.py`'s
//! `CircuitBreaker`. Distinct from [`AgentHealthTracker`], which tracks a
//! rolling success rate for observability rather than gating requests.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandem_types::CircuitBreakerState;
use tokio::fs;
use tokio::sync::RwLock;

const FAILURE_THRESHOLD: u32 = 5;
const FAILURE_WINDOW_S: i64 = 60;
const HALF_OPEN_TIMEOUT_S: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AgentCircuit {
    state: CircuitBreakerState,
    failure_count: u32,
    window_started_at: DateTime<Utc>,
    last_check_time: DateTime<Utc>,
}

impl AgentCircuit {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            window_started_at: now,
            last_check_time: now,
        }
    }
}

/// Async-locked per-agent state machine; every transition happens under one
/// write-lock acquisition so it's atomic.
pub struct CircuitBreaker {
    path: PathBuf,
    agents: RwLock<HashMap<String, AgentCircuit>>,
}

impl CircuitBreaker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let agents = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            agents: RwLock::new(agents),
        }
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let agents = self.agents.read().await;
        let raw = serde_json::to_string_pretty(&*agents)?;
        fs::write(&self.path, raw).await?;
        Ok(())
    }

    /// Whether a request to `agent` is currently allowed. `open` refuses
    /// until the half-open timeout elapses, at which point one trial request
    /// is allowed while the state flips to `half-open`.
    pub async fn allow(&self, agent: &str) -> bool {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        let circuit = agents.entry(agent.to_string()).or_insert_with(|| AgentCircuit::new(now));
        match circuit.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                if (now - circuit.last_check_time).num_seconds() > HALF_OPEN_TIMEOUT_S {
                    circuit.state = CircuitBreakerState::HalfOpen;
                    circuit.last_check_time = now;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, agent: &str) {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        let circuit = agents.entry(agent.to_string()).or_insert_with(|| AgentCircuit::new(now));
        circuit.state = CircuitBreakerState::Closed;
        circuit.failure_count = 0;
        circuit.window_started_at = now;
    }

    pub async fn record_failure(&self, agent: &str) {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        let circuit = agents.entry(agent.to_string()).or_insert_with(|| AgentCircuit::new(now));

        if circuit.state == CircuitBreakerState::HalfOpen {
            circuit.state = CircuitBreakerState::Open;
            circuit.last_check_time = now;
            return;
        }

        if (now - circuit.window_started_at).num_seconds() > FAILURE_WINDOW_S {
            circuit.failure_count = 0;
            circuit.window_started_at = now;
        }
        circuit.failure_count += 1;
        if circuit.failure_count >= FAILURE_THRESHOLD {
            circuit.state = CircuitBreakerState::Open;
            circuit.last_check_time = now;
        }
    }

    pub async fn state(&self, agent: &str) -> CircuitBreakerState {
        self.agents
            .read()
            .await
            .get(agent)
            .map(|c| c.state)
            .unwrap_or(CircuitBreakerState::Closed)
    }

    pub async fn snapshot(&self) -> HashMap<String, CircuitBreakerState> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), c.state))
            .collect()
    }

    /// Admin override: force an agent's circuit back to `closed`.
    pub async fn reset(&self, agent: &str) {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        agents.insert(agent.to_string(), AgentCircuit::new(now));
    }
}

/// Rolling success-rate view, separate from the gating state machine above.
/// Grounded on `error_recovery.py`'s health-tracking companion to
/// `CircuitBreaker`, exposed read-only through C12 for observability.
pub struct AgentHealthTracker {
    window: RwLock<HashMap<String, Vec<bool>>>,
    capacity: usize,
}

impl AgentHealthTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn record(&self, agent: &str, succeeded: bool) {
        let mut window = self.window.write().await;
        let entries = window.entry(agent.to_string()).or_default();
        entries.push(succeeded);
        if entries.len() > self.capacity {
            entries.remove(0);
        }
    }

    /// `None` when there's no history yet for `agent`.
    pub async fn success_rate(&self, agent: &str) -> Option<f64> {
        let window = self.window.read().await;
        let entries = window.get(agent)?;
        if entries.is_empty() {
            return None;
        }
        let successes = entries.iter().filter(|s| **s).count();
        Some(successes as f64 / entries.len() as f64)
    }
}

impl Default for AgentHealthTracker {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn five_failures_within_window_open_the_circuit() {
        let breaker = CircuitBreaker::new("/tmp/does-not-matter.json");
        for _ in 0..5 {
            breaker.record_failure("planner").await;
        }
        assert_eq!(breaker.state("planner").await, CircuitBreakerState::Open);
        assert!(!breaker.allow("planner").await);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("/tmp/does-not-matter.json");
        for _ in 0..4 {
            breaker.record_failure("planner").await;
        }
        breaker.record_success("planner").await;
        for _ in 0..4 {
            breaker.record_failure("planner").await;
        }
        assert_eq!(breaker.state("planner").await, CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("/tmp/does-not-matter.json");
        for _ in 0..5 {
            breaker.record_failure("planner").await;
        }
        {
            let mut agents = breaker.agents.write().await;
            let c = agents.get_mut("planner").unwrap();
            c.last_check_time = Utc::now() - chrono::Duration::seconds(HALF_OPEN_TIMEOUT_S + 1);
        }
        assert!(breaker.allow("planner").await);
        assert_eq!(breaker.state("planner").await, CircuitBreakerState::HalfOpen);
        breaker.record_failure("planner").await;
        assert_eq!(breaker.state("planner").await, CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = CircuitBreaker::new("/tmp/does-not-matter.json");
        for _ in 0..5 {
            breaker.record_failure("planner").await;
        }
        breaker.reset("planner").await;
        assert_eq!(breaker.state("planner").await, CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("circuit_breakers.json");
        let breaker = CircuitBreaker::new(&path);
        for _ in 0..5 {
            breaker.record_failure("planner").await;
        }
        breaker.persist().await.unwrap();

        let reloaded = CircuitBreaker::load(&path).await;
        assert_eq!(reloaded.state("planner").await, CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn health_tracker_reports_rolling_rate() {
        let tracker = AgentHealthTracker::new(4);
        tracker.record("planner", true).await;
        tracker.record("planner", true).await;
        tracker.record("planner", false).await;
        tracker.record("planner", true).await;
        assert_eq!(tracker.success_rate("planner").await, Some(0.75));
    }
}
