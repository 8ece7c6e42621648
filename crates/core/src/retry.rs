//! Retry policy for background jobs and transient storage failures
//!
//! A job is delivered at most `max_attempts` times. Between deliveries the
//! worker waits `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
//! Terminal failures (bad input, missing files) are never retried.
//!
//! # Examples
//!
//! ```
//! use recommdo_core::retry::{RetryDecision, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.decide(1, true), RetryDecision::Retry(Duration::from_secs(2)));
//! assert_eq!(policy.decide(3, true), RetryDecision::GiveUp);
//! assert_eq!(policy.decide(1, false), RetryDecision::GiveUp);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total deliveries allowed, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Policy with the given attempt budget and default delays
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Decide after `attempt` (1-based) failed. `retryable` is false for
    /// terminal errors.
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if !retryable || attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.delay_for(attempt))
        }
    }
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// attempt budget is spent.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    mut operation: F,
    policy: &RetryPolicy,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => match policy.decide(attempt, is_retryable(&error)) {
                RetryDecision::GiveUp => {
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        "Giving up after failed attempt"
                    );
                    return Err(error);
                }
                RetryDecision::Retry(delay) => {
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after delay"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_decide_respects_budget() {
        let policy = RetryPolicy::with_max_attempts(3);
        assert!(matches!(policy.decide(1, true), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide(2, true), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(3, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_terminal_errors_never_retry() {
        let policy = RetryPolicy::with_max_attempts(10);
        assert_eq!(policy.decide(1, false), RetryDecision::GiveUp);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));

        let result: Result<&str, &str> = retry_with_backoff(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient")
                } else {
                    Ok("done")
                }
            },
            &policy,
            |_| true,
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_stops_on_terminal_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(5));

        let result: Result<(), &str> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad input")
            },
            &policy,
            |_| false,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
