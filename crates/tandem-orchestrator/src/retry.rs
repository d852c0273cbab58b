//! Retry executor (C4), ported from `error_handler.py::calculate_backoff_delay`
//! and `error_recovery.py::_should_retry`/`_calculate_backoff`. The two
//! sources agree on the backoff formula; this is a single merged port.

use std::time::Duration;

use rand::Rng;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Coarse error classes the dispatcher maps HTTP/provider failures onto
/// before asking the retry executor whether to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    NotFound,
    RateLimit,
    Timeout,
    ServerError,
    Connection,
    Validation,
    Unknown,
}

impl ErrorClass {
    /// Classifies from an HTTP-ish status code, falling back to text
    /// inspection when no status is available (matches the Python
    /// classifier's "inspects error text/class" fallback).
    pub fn from_status(status: Option<u16>, message: &str) -> Self {
        match status {
            Some(401) | Some(403) => ErrorClass::Auth,
            Some(404) => ErrorClass::NotFound,
            Some(429) => ErrorClass::RateLimit,
            Some(s) if s >= 500 => ErrorClass::ServerError,
            Some(400) => ErrorClass::Validation,
            _ => Self::from_text(message),
        }
    }

    fn from_text(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("unauthorized") || lower.contains("forbidden") || lower.contains("401") || lower.contains("403") {
            ErrorClass::Auth
        } else if lower.contains("not found") || lower.contains("404") {
            ErrorClass::NotFound
        } else if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
            ErrorClass::RateLimit
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ErrorClass::Timeout
        } else if lower.contains("connection") {
            ErrorClass::Connection
        } else if lower.contains("validation") || lower.contains("bad request") {
            ErrorClass::Validation
        } else {
            ErrorClass::Unknown
        }
    }

    /// `auth`/`not-found` never retry; everything else does.
    pub fn should_retry(self) -> bool {
        !matches!(self, ErrorClass::Auth | ErrorClass::NotFound)
    }
}

/// `delay(attempt) = min(max_delay, base_delay * 2^attempt)`, ±10% uniform
/// jitter, floored at 100ms. `attempt` is 0-indexed.
pub fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let scaled = policy.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = scaled.min(policy.max_delay.as_secs_f64());
    let delay = if policy.jitter {
        let mut rng = rand::thread_rng();
        let jitter = capped * 0.1 * (2.0 * rng.gen::<f64>() - 1.0);
        (capped + jitter).max(0.1)
    } else {
        capped
    };
    Duration::from_secs_f64(delay)
}

/// Runs `attempt_fn` up to `policy.max_retries + 1` times. `classify` maps a
/// failure to an [`ErrorClass`]; classes that never retry (auth/not-found)
/// and [`OrchestratorError::is_terminal`] short-circuit immediately. An
/// explicit wait (e.g. a `Retry-After` header) overrides the computed delay
/// for that one attempt.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    mut attempt_fn: F,
    classify: impl Fn(&OrchestratorError) -> (ErrorClass, Option<Duration>),
) -> Result<T, OrchestratorError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, OrchestratorError>>,
{
    let mut last_error = None;
    for attempt in 0..=policy.max_retries {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_terminal() {
                    return Err(err);
                }
                let (class, explicit_wait) = classify(&err);
                if !class.should_retry() || attempt == policy.max_retries {
                    last_error = Some(err);
                    break;
                }
                let delay = explicit_wait.unwrap_or_else(|| calculate_backoff(attempt, policy));
                tracing::warn!(attempt, ?delay, error = %err, "retrying after failure");
                tokio::time::sleep(delay).await;
                last_error = Some(err);
            }
        }
    }
    Err(last_error.expect("loop always runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_by_max_delay() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let delay = calculate_backoff(10, &policy);
        assert!(delay <= policy.max_delay);
    }

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(calculate_backoff(0, &policy), Duration::from_secs(2));
        assert_eq!(calculate_backoff(1, &policy), Duration::from_secs(4));
        assert_eq!(calculate_backoff(2, &policy), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = calculate_backoff(1, &policy).as_secs_f64();
            assert!(delay >= 4.0 * 0.9 - 1e-9);
            assert!(delay <= 4.0 * 1.1 + 1e-9);
        }
    }

    #[test]
    fn auth_and_not_found_never_retry() {
        assert!(!ErrorClass::from_status(Some(401), "").should_retry());
        assert!(!ErrorClass::from_status(Some(404), "").should_retry());
        assert!(ErrorClass::from_status(Some(429), "").should_retry());
        assert!(ErrorClass::from_status(Some(500), "").should_retry());
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            max_retries: 3,
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry_with_policy(
            &policy,
            |_attempt| {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OrchestratorError::ProviderTransient {
                            provider: "x".into(),
                            message: "timeout".into(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| (ErrorClass::Timeout, None),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn terminal_errors_never_retry() {
        let policy = RetryPolicy::default();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = retry_with_policy(
            &policy,
            |_attempt| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    Err(OrchestratorError::BudgetExceeded {
                        job_id: "job-1".into(),
                        projected: 10.0,
                        limit: 5.0,
                    })
                }
            },
            |_| (ErrorClass::Unknown, None),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
