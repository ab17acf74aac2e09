//! Retry with exponential backoff.
//!
//! Used in two places: the worker pool redelivers a failed delivery unit,
//! and the store executor resends items the store left unprocessed.
//!
//! ```text
//! attempt 0 ─→ fail ─→ wait 100ms
//! attempt 1 ─→ fail ─→ wait 200ms
//! attempt 2 ─→ fail ─→ wait 400ms
//! ...                  (capped at max_backoff)
//! attempt max_retries ─→ fail ─→ give up
//! ```
//!
//! Only [`dynaflush_core::FlushError::is_retryable`] errors are retried. Validation,
//! configuration and coercion failures fail the same way on every attempt.

use std::future::Future;
use std::time::Duration;

use dynaflush_core::Result;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration for exponential backoff.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_retries` retries are spent. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => {
                warn!(error = %e, "non-retryable error, giving up");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_retries => {
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    error = %e,
                    "max retries exhausted, giving up"
                );
                return Err(e);
            }
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "retryable error, backing off"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynaflush_core::FlushError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(10),
            2.0,
        )
    }

    // ========================================================================
    // RetryPolicy - backoff calculation
    // ========================================================================

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_backoff_exponential_growth_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max_cap() {
        let policy = RetryPolicy::new(
            20,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        );
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(50), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_with_multiplier_1_no_growth() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(250),
            Duration::from_secs(30),
            1.0,
        );
        for attempt in 0..5 {
            assert_eq!(policy.backoff(attempt), Duration::from_millis(250));
        }
    }

    // ========================================================================
    // retry_with_backoff
    // ========================================================================

    #[tokio::test]
    async fn test_retry_immediate_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&fast_policy(3), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, FlushError>(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_eventual_success_on_transport() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&fast_policy(5), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FlushError::Transport("throttled".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_validation_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(5), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FlushError::Validation("bad item".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(FlushError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(2), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(FlushError::Transport(format!("attempt {}", n)))
            }
        })
        .await;

        match result {
            Err(FlushError::Transport(msg)) => assert_eq!(msg, "attempt 2"),
            other => panic!("expected transport error, got {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_zero_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(0), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FlushError::Transport("down".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
