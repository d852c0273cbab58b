//! Pipeline driver (C9), ported from `autonomous_runner.py`'s
//! `_run_job_pipeline`/`_run_phase_with_retry`. Drives the five phases in
//! `phases.rs` in order, retrying each phase (except a budget overrun, which
//! is terminal) with the shared [`RetryPolicy`], and always writes a
//! `result.json` before returning.

use std::time::Duration;

use serde::Serialize;
use tandem_core::DataRoot;
use tandem_types::{Job, JobStatus, PlanStep, ProgressRecord};
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::OrchestratorError;
use crate::intent_router::IntentRouter;
use crate::phases::{self, DeliverResult, PhaseContext, VerifyResult};
use crate::retry::{ErrorClass, RetryPolicy};
use crate::tool_loop::ToolLoop;

/// The pipeline retries each phase at most this many times, independent of
/// the per-call provider-chain retries `ToolLoop`/`dispatch` already do.
const PHASE_RETRY_POLICY: RetryPolicy = RetryPolicy {
    max_retries: 3,
    base_delay: Duration::from_secs(3),
    max_delay: Duration::from_secs(12),
    jitter: true,
};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success {
        summary: String,
        total_cost_usd: f64,
        plan: Vec<PlanStepSummary>,
        verify: VerifyResult,
        deliver: DeliverResult,
    },
    BudgetExceeded {
        projected: f64,
        limit: f64,
    },
    Cancelled,
    Failed {
        phase: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStepSummary {
    pub description: String,
    pub status: String,
}

pub async fn run(
    job: &Job,
    data_root: &DataRoot,
    tool_loop: &ToolLoop<'_>,
    intent_router: &IntentRouter,
    circuit_breaker: &CircuitBreaker,
    budget_limit_usd: f64,
    cancel: CancellationToken,
) -> PipelineOutcome {
    let mut progress = ProgressRecord::new(job.id.clone());
    let ctx = PhaseContext {
        job,
        tool_loop,
        data_root,
        budget_limit_usd,
    };

    let routing = intent_router.route(&job.task);
    let execute_role = routing.agent_role.to_string();

    let outcome = run_phases(&ctx, &mut progress, &execute_role, circuit_breaker, &cancel).await;
    persist_progress(data_root, &progress).await;
    persist_result(data_root, job, &outcome).await;
    outcome
}

async fn run_phases(
    ctx: &PhaseContext<'_>,
    progress: &mut ProgressRecord,
    execute_role: &str,
    circuit_breaker: &CircuitBreaker,
    cancel: &CancellationToken,
) -> PipelineOutcome {
    macro_rules! bail_if_cancelled {
        () => {
            if cancel.is_cancelled() {
                progress.mark_cancelled();
                return PipelineOutcome::Cancelled;
            }
        };
    }

    bail_if_cancelled!();
    let research = match with_phase_retry("research", circuit_breaker, "planner", || {
        phases::research_phase(ctx, "planner", &mut *progress)
    })
    .await
    {
        Ok(text) => text,
        Err(outcome) => return outcome,
    };

    bail_if_cancelled!();
    let mut plan: Vec<PlanStep> = match with_phase_retry("plan", circuit_breaker, "planner", || {
        phases::plan_phase(ctx, "planner", &mut *progress, &research)
    })
    .await
    {
        Ok(plan) => plan,
        Err(outcome) => return outcome,
    };

    bail_if_cancelled!();
    let cancel_flag = || cancel.is_cancelled();
    if let Err(err) = phases::execute_phase(ctx, execute_role, &mut *progress, &mut plan, cancel_flag).await {
        return classify_terminal(err, "execute");
    }

    bail_if_cancelled!();
    let verify_result = match with_phase_retry("verify", circuit_breaker, "security-auditor", || {
        phases::verify_phase(ctx, "security-auditor", &mut *progress, &plan)
    })
    .await
    {
        Ok(result) => result,
        Err(outcome) => return outcome,
    };

    bail_if_cancelled!();
    let deliver_result = match with_phase_retry("deliver", circuit_breaker, "planner", || {
        phases::deliver_phase(ctx, "planner", &mut *progress, &verify_result)
    })
    .await
    {
        Ok(result) => result,
        Err(outcome) => return outcome,
    };

    let plan_summary = plan
        .iter()
        .map(|s| PlanStepSummary {
            description: s.description.clone(),
            status: format!("{:?}", s.status).to_lowercase(),
        })
        .collect();

    PipelineOutcome::Success {
        summary: deliver_result.summary.clone(),
        total_cost_usd: progress.accumulated_cost_usd,
        plan: plan_summary,
        verify: verify_result,
        deliver: deliver_result,
    }
}

/// Runs `phase_fn` up to `PHASE_RETRY_POLICY.max_retries + 1` times, recording
/// each outcome against the circuit breaker for `agent_role`. A budget
/// overrun or cancellation is terminal and skips remaining retries.
async fn with_phase_retry<T, F, Fut>(
    phase_name: &str,
    circuit_breaker: &CircuitBreaker,
    agent_role: &str,
    mut phase_fn: F,
) -> Result<T, PipelineOutcome>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, OrchestratorError>>,
{
    let mut last_err = None;
    for attempt in 0..=PHASE_RETRY_POLICY.max_retries {
        if !circuit_breaker.allow(agent_role).await {
            return Err(PipelineOutcome::Failed {
                phase: phase_name.to_string(),
                reason: format!("circuit breaker open for agent `{agent_role}`"),
            });
        }
        match phase_fn().await {
            Ok(value) => {
                circuit_breaker.record_success(agent_role).await;
                return Ok(value);
            }
            Err(err) => {
                circuit_breaker.record_failure(agent_role).await;
                if err.is_terminal() {
                    return Err(terminal_outcome(err));
                }
                if attempt == PHASE_RETRY_POLICY.max_retries {
                    last_err = Some(err);
                    break;
                }
                let class = ErrorClass::from_status(None, &err.to_string());
                if !class.should_retry() {
                    last_err = Some(err);
                    break;
                }
                let delay = crate::retry::calculate_backoff(attempt, &PHASE_RETRY_POLICY);
                tracing::warn!(phase = phase_name, attempt, "phase failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(PipelineOutcome::Failed {
        phase: phase_name.to_string(),
        reason: last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".to_string()),
    })
}

fn terminal_outcome(err: OrchestratorError) -> PipelineOutcome {
    match err {
        OrchestratorError::BudgetExceeded { projected, limit, .. } => {
            PipelineOutcome::BudgetExceeded { projected, limit }
        }
        OrchestratorError::Cancelled { .. } => PipelineOutcome::Cancelled,
        other => PipelineOutcome::Failed {
            phase: "unknown".to_string(),
            reason: other.to_string(),
        },
    }
}

fn classify_terminal(err: OrchestratorError, phase: &str) -> PipelineOutcome {
    match err {
        OrchestratorError::BudgetExceeded { projected, limit, .. } => {
            PipelineOutcome::BudgetExceeded { projected, limit }
        }
        OrchestratorError::Cancelled { .. } => PipelineOutcome::Cancelled,
        other => PipelineOutcome::Failed {
            phase: phase.to_string(),
            reason: other.to_string(),
        },
    }
}

async fn persist_progress(data_root: &DataRoot, progress: &ProgressRecord) {
    let path = data_root.progress_file(&progress.job_id);
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Ok(raw) = serde_json::to_string_pretty(progress) {
        let _ = tokio::fs::write(&path, raw).await;
    }
}

async fn persist_result(data_root: &DataRoot, job: &Job, outcome: &PipelineOutcome) {
    let path = data_root.result_file(&job.id);
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let status = match outcome {
        PipelineOutcome::Success { .. } => JobStatus::Done,
        PipelineOutcome::BudgetExceeded { .. } | PipelineOutcome::Failed { .. } => JobStatus::Failed,
        PipelineOutcome::Cancelled => JobStatus::Cancelled,
    };
    let record = serde_json::json!({
        "job_id": job.id,
        "status": format!("{:?}", status).to_lowercase(),
        "outcome": outcome,
    });
    if let Ok(raw) = serde_json::to_string_pretty(&record) {
        let _ = tokio::fs::write(&path, raw).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_outcome_maps_budget_exceeded() {
        let err = OrchestratorError::BudgetExceeded {
            job_id: "job-1".to_string(),
            projected: 6.0,
            limit: 5.0,
        };
        match terminal_outcome(err) {
            PipelineOutcome::BudgetExceeded { projected, limit } => {
                assert_eq!(projected, 6.0);
                assert_eq!(limit, 5.0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn classify_terminal_maps_cancelled() {
        let err = OrchestratorError::Cancelled { job_id: "job-1".to_string() };
        assert!(matches!(classify_terminal(err, "execute"), PipelineOutcome::Cancelled));
    }
}
