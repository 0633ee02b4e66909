// Retry logic with backend retry-after hint support
// Author: kelexine (https://github.com/kelexine)

use crate::config::OrchestratorConfig;
use crate::error::{BridgeError, Result};
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest server-suggested delay that is honoured as-is.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_interval: config.initial_backoff(),
            max_interval: config.max_backoff(),
        }
    }

    /// One attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Create exponential backoff configuration for retries
pub fn create_backoff(policy: &RetryPolicy) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: policy.initial_interval,
        initial_interval: policy.initial_interval,
        randomization_factor: 0.3, // Add jitter
        multiplier: 2.0,           // Double each time
        max_interval: policy.max_interval,
        // Attempts are bounded by max_attempts instead
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Server hints are honoured up to [`MAX_RETRY_AFTER`].
pub fn cap_retry_after(delay: Duration) -> Duration {
    delay.min(MAX_RETRY_AFTER)
}

/// Execute `operation`, retrying retryable [`BridgeError`]s.
///
/// - Uses the error's `retry_after` hint when the backend sent one
/// - Falls back to exponential backoff
/// - Gives up after `policy.max_attempts`, returning the last error
/// - Returns `Cancelled` as soon as `cancel` fires, including mid-sleep
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(policy);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            outcome = operation(attempt) => outcome,
        };

        match outcome {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_retryable() || attempt >= policy.max_attempts {
                    return Err(e);
                }

                let delay = match e.retry_after() {
                    Some(hint) => {
                        debug!(
                            "{} failed (attempt {}), backend suggests waiting {}ms",
                            operation_name,
                            attempt,
                            hint.as_millis()
                        );
                        cap_retry_after(hint)
                    }
                    None => backoff.next_backoff().unwrap_or(policy.max_interval),
                };

                warn!(
                    "{} failed with {} (attempt {}/{}), retrying after {}ms",
                    operation_name,
                    e.kind(),
                    attempt,
                    policy.max_attempts,
                    delay.as_millis()
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retries_retryable_until_success() {
        let calls = &AtomicU32::new(0);
        let result = with_retry("test", &fast_policy(3), &CancellationToken::new(), |_| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BridgeError::ServiceUnavailable("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> =
            with_retry("test", &fast_policy(5), &CancellationToken::new(), |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::ModelNotFound("gpt-x".into()))
            })
            .await;

        assert!(matches!(result, Err(BridgeError::ModelNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> =
            with_retry("test", &fast_policy(2), &CancellationToken::new(), |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::rate_limited("429", Some(Duration::from_millis(1))))
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(30),
        };

        let trigger = cancel.clone();
        let result: Result<()> = with_retry("test", &policy, &cancel, |_| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Err(BridgeError::Network("reset".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(BridgeError::Cancelled)));
    }

    #[test]
    fn test_retry_after_is_capped() {
        assert_eq!(cap_retry_after(Duration::from_secs(120)), MAX_RETRY_AFTER);
        assert_eq!(cap_retry_after(Duration::from_secs(5)).as_secs(), 5);
    }
}
