//! Generic bounded retry with exponential backoff.
//!
//! One policy parameterises both the source fetch and message delivery
//! rather than every call site reimplementing its own sleep loop.

use std::future::Future;
use std::time::Duration;

use crate::utils::Shutdown;

/// Errors that can participate in the retry loop.
pub trait Transient {
    /// Whether retrying could plausibly help.
    fn is_transient(&self) -> bool;

    /// The error raised when shutdown interrupts the loop.
    fn cancelled() -> Self;
}

/// Bounded exponential backoff: attempt n sleeps `base · 2^(n-1)`, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Fractional jitter added on top of the computed delay (0.0..=1.0)
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy for source fetches: 3 attempts, 1 s base, 8 s cap.
    pub fn source() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(8),
            jitter: 0.1,
        }
    }

    /// Policy for message delivery: same envelope as the source policy.
    pub fn delivery() -> Self {
        Self::source()
    }

    /// Backoff delay before the attempt following `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.cap);
        if self.jitter <= 0.0 {
            return backoff;
        }
        let frac = subsec_fraction();
        backoff.mul_f64(1.0 + self.jitter * frac)
    }
}

/// Cheap jitter source; clock subsecond noise is plenty here.
fn subsec_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1_000) as f64 / 1_000.0
}

/// Run `op` until it succeeds, returns a final error, or the attempt
/// budget is exhausted. Shutdown is honoured between attempts.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 1;
    loop {
        if shutdown.is_cancelled() {
            return Err(E::cancelled());
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                log::debug!(
                    "attempt {attempt}/{} failed ({e}), retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return Err(E::cancelled()),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Final,
        Cancelled,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Transient)
        }

        fn cancelled() -> Self {
            Self::Cancelled
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::ZERO,
            cap: Duration::ZERO,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(8),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let shutdown = Shutdown::inert();

        let result: Result<u32, TestError> =
            retry_with_policy(&fast_policy(), &shutdown, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TestError::Transient)
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_final_error_not_retried() {
        let calls = AtomicU32::new(0);
        let shutdown = Shutdown::inert();

        let result: Result<u32, TestError> =
            retry_with_policy(&fast_policy(), &shutdown, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Final)
            })
            .await;

        assert!(matches!(result, Err(TestError::Final)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let shutdown = Shutdown::inert();

        let result: Result<u32, TestError> =
            retry_with_policy(&fast_policy(), &shutdown, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Transient)
            })
            .await;

        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let (handle, shutdown) = crate::utils::shutdown_channel();
        handle.trigger();

        let result: Result<u32, TestError> =
            retry_with_policy(&fast_policy(), &shutdown, || async { Ok(1) }).await;

        assert!(matches!(result, Err(TestError::Cancelled)));
    }
}
