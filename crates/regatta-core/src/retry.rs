//! Retry harness for transient failures.
//!
//! Exponential backoff with a cap on attempts and on total elapsed time.
//! Only `Error::Transient` is retried; after exhaustion the error is
//! promoted to `Permanent`.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{Error, Result};

/// Backoff policy shared by the launcher, placement engine and goal-state
/// driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on total time across attempts. Zero = unbounded.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given zero-based attempt: doubles from `min_backoff`,
    /// capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let backoff = self.min_backoff.saturating_mul(factor);
        backoff.min(self.max_backoff)
    }
}

/// Run `op`, retrying transient errors per `policy`.
///
/// Non-transient errors return immediately. Exhaustion (attempts or
/// elapsed) promotes the final transient error to `Permanent`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(%what, attempt, "retries exhausted");
                    return Err(e.into_permanent());
                }
                if !policy.max_elapsed.is_zero() && started.elapsed() >= policy.max_elapsed {
                    warn!(%what, elapsed_ms = started.elapsed().as_millis() as u64, "retry budget elapsed");
                    return Err(e.into_permanent());
                }
                let backoff = policy.backoff_for_attempt(attempt - 1);
                debug!(%what, attempt, backoff_ms = backoff.as_millis() as u64, "retrying after transient error");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            max_elapsed: Duration::ZERO,
        };
        assert_eq!(p.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(p.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(p.backoff_for_attempt(2), Duration::from_millis(350));
        assert_eq!(p.backoff_for_attempt(20), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(), "test-op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_promotes_to_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&fast_policy(), "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Transient("always".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Permanent(_))));
        // Exactly max_attempts calls, no more.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&fast_policy(), "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Validation("bad input".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
