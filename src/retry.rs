//! Retry and timeout policy shared by every AI service call.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound observed for the slowest per-document operation.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub attempts: u32,
    /// Fixed pause between attempts.
    #[serde(with = "millis")]
    pub backoff: Duration,
    /// Bound on each individual attempt.
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const fn once(timeout: Duration) -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
            timeout,
        }
    }

    pub const fn fixed(attempts: u32, backoff: Duration, timeout: Duration) -> Self {
        Self {
            attempts,
            backoff,
            timeout,
        }
    }
}

/// Per-call policies. Every call goes through [`run_with_policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicies {
    pub classify: RetryPolicy,
    pub extract: RetryPolicy,
    pub parse: RetryPolicy,
    pub summarize: RetryPolicy,
    pub generate: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            classify: RetryPolicy::fixed(5, Duration::from_millis(500), DEFAULT_CALL_TIMEOUT),
            extract: RetryPolicy::once(DEFAULT_CALL_TIMEOUT),
            parse: RetryPolicy::once(DEFAULT_CALL_TIMEOUT),
            summarize: RetryPolicy::once(DEFAULT_CALL_TIMEOUT),
            generate: RetryPolicy::once(DEFAULT_CALL_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{label} failed after {attempts} attempt(s): {last_error}")]
pub struct RetryError {
    pub label: String,
    pub attempts: u32,
    pub last_error: String,
    /// One message per failed attempt, oldest first.
    pub failures: Vec<String>,
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. A timed-out attempt counts as a
/// failed one.
pub async fn run_with_policy<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut failures = Vec::new();

    for attempt in 1..=attempts {
        let outcome = match tokio::time::timeout(policy.timeout, op(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("timed out after {:?}", policy.timeout),
        };

        warn!("{} attempt {}/{} failed: {}", label, attempt, attempts, outcome);
        failures.push(outcome);

        if attempt < attempts && !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(RetryError {
        label: label.to_string(),
        attempts,
        last_error: failures.last().cloned().unwrap_or_default(),
        failures,
    })
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1), Duration::from_secs(1));

        let value = run_with_policy("classify", &policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    anyhow::bail!("directory not ready")
                }
                Ok("invoice")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "invoice");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_reports_every_failure() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO, Duration::from_secs(1));
        let err = run_with_policy("classify", &policy, |attempt| async move {
            Err::<(), _>(anyhow::anyhow!("boom {}", attempt))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "boom 3");
        assert_eq!(err.failures, vec!["boom 1", "boom 2", "boom 3"]);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let policy = RetryPolicy::once(Duration::from_millis(10));
        let err = run_with_policy("extract", &policy, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert!(err.last_error.starts_with("timed out"));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO, Duration::from_secs(1));
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let err = rt
            .block_on(run_with_policy("parse", &policy, |_| async {
                Err::<(), _>(anyhow::anyhow!("nope"))
            }))
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }
}
