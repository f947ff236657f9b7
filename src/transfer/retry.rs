//! Activity Retry Policy
//!
//! Per-attempt timeout plus capped exponential backoff. Errors whose
//! `is_retryable()` is false end the loop immediately.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, warn};

use super::error::TransferError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    /// 0 = unlimited
    pub maximum_attempts: u32,
}

impl RetryPolicy {
    /// Lock acquisition: fixed 5s steps capped at 10s, about two minutes in total
    pub fn lock_default() -> Self {
        Self {
            initial_interval_ms: 5_000,
            backoff_coefficient: 1.0,
            maximum_interval_ms: 10_000,
            maximum_attempts: 24,
        }
    }

    pub fn activity_default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 30_000,
            maximum_attempts: 5,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_interval_ms as f64 * self.backoff_coefficient.powi(exponent);
        let capped = scaled.min(self.maximum_interval_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn allows_another(&self, attempt: u32) -> bool {
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl ActivityOptions {
    /// Longest span from the start of one attempt to the start of the next
    pub fn refresh_window(&self) -> Duration {
        let policy = &self.retry_policy;
        let longest_delay = policy.delay_for(1).max(policy.delay_for(u32::MAX));
        self.start_to_close_timeout.saturating_add(longest_delay)
    }
}

/// Run `op` until it succeeds, fails non-retryably, or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. An attempt that exceeds the
/// timeout is dropped and counts as a retryable `ActivityTimeout`.
pub async fn execute_activity<T, F, Fut>(
    name: &str,
    options: &ActivityOptions,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(options.start_to_close_timeout, op(attempt)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransferError::ActivityTimeout(format!(
                "{name} attempt {attempt} exceeded {:?}",
                options.start_to_close_timeout
            ))),
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            warn!(activity = name, attempt, error = %err, "Activity failed (non-retryable)");
            return Err(err);
        }
        if !options.retry_policy.allows_another(attempt) {
            error!(activity = name, attempt, error = %err, "Activity retries exhausted");
            return Err(err);
        }

        let delay = options.retry_policy.delay_for(attempt);
        warn!(
            activity = name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Activity failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> ActivityOptions {
        ActivityOptions {
            start_to_close_timeout: Duration::from_millis(200),
            retry_policy: RetryPolicy {
                initial_interval_ms: 1,
                backoff_coefficient: 1.0,
                maximum_interval_ms: 1,
                maximum_attempts: max_attempts,
            },
        }
    }

    #[test]
    fn test_delay_backoff_is_capped() {
        let policy = RetryPolicy::activity_default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));

        let lock = RetryPolicy::lock_default();
        assert_eq!(lock.delay_for(1), Duration::from_secs(5));
        assert_eq!(lock.delay_for(20), Duration::from_secs(5));
    }

    #[test]
    fn test_refresh_window() {
        let options = ActivityOptions {
            start_to_close_timeout: Duration::from_secs(60),
            retry_policy: RetryPolicy::activity_default(),
        };
        assert_eq!(options.refresh_window(), Duration::from_secs(90));

        // Shrinking backoff: the first delay is the longest
        let shrinking = ActivityOptions {
            start_to_close_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy {
                initial_interval_ms: 4_000,
                backoff_coefficient: 0.5,
                maximum_interval_ms: 10_000,
                maximum_attempts: 0,
            },
        };
        assert_eq!(shrinking.refresh_window(), Duration::from_secs(5));
    }

    #[test]
    fn test_allows_another() {
        let mut policy = RetryPolicy::activity_default();
        assert!(policy.allows_another(4));
        assert!(!policy.allows_another(5));

        policy.maximum_attempts = 0;
        assert!(policy.allows_another(1_000));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = execute_activity("flaky", &fast(5), move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TransferError::DatabaseError("reset".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = execute_activity("validate", &fast(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::SameAccount) }
        })
        .await;

        assert_eq!(result, Err(TransferError::SameAccount));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let result: Result<(), _> = execute_activity("down", &fast(3), |_| async {
            Err(TransferError::LockContended("k".into()))
        })
        .await;
        assert_eq!(result, Err(TransferError::LockContended("k".into())));
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let result: Result<(), _> = execute_activity("slow", &fast(2), |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TransferError::ActivityTimeout(_))));
    }
}
