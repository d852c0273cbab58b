//! HTTP surface for the job orchestrator: submitting and inspecting jobs,
//! plus the C12 operational routes in `health.rs`. The chat-engine surface
//! this crate used to carry (sessions, leases, MCP bridging, agent teams)
//! has no counterpart here — a job orchestrator has jobs, not sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use tandem_orchestrator::JobRunner;

mod health;

pub use health::HealthState;

#[derive(Clone)]
pub struct AppState {
    pub job_runner: Arc<JobRunner>,
    pub health: HealthState,
}

#[derive(Debug, Deserialize)]
struct SubmitJobInput {
    task: String,
    project: String,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitJobInput>,
) -> Result<Json<Value>, StatusCode> {
    let job = state
        .job_runner
        .submit(input.task, input.project)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to submit job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(json!(job)))
}

async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<Value>, StatusCode> {
    match state.job_runner.get_progress(&job_id).await {
        Ok(Some(job)) => Ok(Json(json!(job))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            tracing::error!(error = %err, "failed to load job");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<Value>, StatusCode> {
    if state.job_runner.cancel_job(&job_id).await {
        Ok(Json(json!({ "job_id": job_id, "cancelled": true })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .merge(health::router(state.health.clone()))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let runner = Arc::clone(&state.job_runner);
    let poll_loop = tokio::spawn(async move { runner.run().await });

    let app = app_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    state.job_runner.stop().await;
    poll_loop.abort();
    result?;
    Ok(())
}
