//! Operational HTTP surface (C12): health, circuit-breaker, alert, and cost
//! endpoints for dashboards and ops tooling to poll. Kept deliberately thin
//! — every route reads from state the orchestrator crate already owns and
//! persists; this module adds no new state of its own.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tandem_core::DataRoot;
use tandem_orchestrator::{CircuitBreaker, CostLedger, JobRunner};
use tandem_types::AlertRecord;

#[derive(Clone)]
pub struct HealthState {
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub cost_ledger: Arc<CostLedger>,
    pub data_root: Arc<DataRoot>,
    pub job_runner: Arc<JobRunner>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health/detailed", get(detailed_health))
        .route("/health/circuit-breakers", get(all_circuit_breakers))
        .route("/health/circuit-breakers/{agent}", get(one_circuit_breaker))
        .route("/health/circuit-breakers/{agent}/reset", post(reset_circuit_breaker))
        .route("/health/alerts", get(alerts))
        .route("/health/costs", get(costs))
        .with_state(state)
}

async fn detailed_health(State(state): State<HealthState>) -> Json<Value> {
    let (started, succeeded, failed, budget_exceeded, cancelled) = state.job_runner.stats_snapshot().await;
    let active = state.job_runner.active_job_ids().await;
    let circuits = state.circuit_breaker.snapshot().await;

    Json(json!({
        "status": "ok",
        "active_jobs": active,
        "stats": {
            "started": started,
            "succeeded": succeeded,
            "failed": failed,
            "budget_exceeded": budget_exceeded,
            "cancelled": cancelled,
        },
        "circuit_breakers": circuits,
    }))
}

async fn all_circuit_breakers(State(state): State<HealthState>) -> Json<Value> {
    Json(json!(state.circuit_breaker.snapshot().await))
}

async fn one_circuit_breaker(State(state): State<HealthState>, Path(agent): Path<String>) -> Json<Value> {
    Json(json!({ "agent": agent.clone(), "state": state.circuit_breaker.state(&agent).await }))
}

async fn reset_circuit_breaker(
    State(state): State<HealthState>,
    Path(agent): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.circuit_breaker.reset(&agent).await;
    state
        .circuit_breaker
        .persist()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "agent": agent, "state": "closed" })))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

async fn alerts(State(state): State<HealthState>, Query(query): Query<AlertsQuery>) -> Json<Value> {
    let limit = query.limit.unwrap_or(50);
    let path = state.data_root.alerts_log();
    let records: Vec<AlertRecord> = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw
            .lines()
            .rev()
            .take(limit)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect(),
        Err(_) => Vec::new(),
    };
    Json(json!({ "alerts": records }))
}

async fn costs(State(state): State<HealthState>) -> Json<Value> {
    let metrics = state.cost_ledger.metrics().await;
    Json(json!(metrics))
}
