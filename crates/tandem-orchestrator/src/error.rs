//! Error kinds for the job pipeline, ported from `error_handler.py`'s
//! exception hierarchy and `error_recovery.py`'s recovery decisions. One
//! enum so the pipeline's outcome match stays exhaustive.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("provider rate limited: {provider} ({message})")]
    ProviderRateLimited { provider: String, message: String },

    #[error("provider billing/credit error: {provider} ({message})")]
    ProviderBilling { provider: String, message: String },

    #[error("provider auth error: {provider} ({message})")]
    ProviderAuth { provider: String, message: String },

    #[error("provider not found: {provider} ({message})")]
    ProviderNotFound { provider: String, message: String },

    #[error("provider timeout or transient failure: {provider} ({message})")]
    ProviderTransient { provider: String, message: String },

    #[error("all providers exhausted for chain `{chain}`: {last_error}")]
    AllProvidersExhausted { chain: String, last_error: String },

    #[error("failed to parse JSON in phase `{phase}`: {message}")]
    JsonParseFailed { phase: String, message: String },

    #[error("plan step {index} exhausted all retries: {message}")]
    PlanStepExhausted { index: usize, message: String },

    #[error("budget exceeded for job {job_id}: projected ${projected:.4} exceeds limit ${limit:.4}")]
    BudgetExceeded {
        job_id: String,
        projected: f64,
        limit: f64,
    },

    #[error("job {job_id} was cancelled")]
    Cancelled { job_id: String },

    #[error("phase `{phase}` exhausted all retries: {message}")]
    PhaseExhausted { phase: String, message: String },

    #[error("persistence failure: {message}")]
    Persistence { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Whether this kind should ever be retried locally (§7). Budget and
    /// cancellation are terminal; everything provider-billing/auth related
    /// skips retry in favor of falling to the next provider in the chain.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ProviderRateLimited { .. } | OrchestratorError::ProviderTransient { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::BudgetExceeded { .. } | OrchestratorError::Cancelled { .. }
        )
    }
}
