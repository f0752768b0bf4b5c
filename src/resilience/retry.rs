use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AppResult;
use crate::metrics;

/// Jitter percentage applied to every backoff delay (±20%).
///
/// Keeps clients that failed together from retrying together.
pub const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Floor for a jittered delay.
///
/// Policies with a smaller base delay use their base delay as the floor instead.
pub const MIN_BACKOFF_DELAY: Duration = Duration::from_millis(100);

/// How often and how patiently to retry a failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = 1 + max_retries)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Upstream retry policy from `UPSTREAM_RETRY_*`.
    pub fn upstream(config: &Config) -> Self {
        Self::new(
            config.upstream_retry_max,
            config.upstream_retry_base_delay,
            config.upstream_retry_max_delay,
        )
    }

    /// Jittered delay to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = backoff_delay(attempt, self.base_delay, self.max_delay);
        let delay_ms = delay.as_millis() as f64;
        let jitter = delay_ms * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0);
        let floor = MIN_BACKOFF_DELAY.min(self.base_delay).as_millis() as f64;

        Duration::from_millis((delay_ms + jitter).max(floor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Capped exponential delay without jitter: `base * 2^(attempt-1)`, at most `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay_ms).min(max)
}

/// Generate a random jitter value between 0.0 and 1.0.
pub fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// Every failure is retried; the last error is returned once
/// `1 + max_retries` attempts have failed. `operation` labels logs and metrics.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, retries = attempt, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if attempt >= policy.max_retries => {
                warn!(operation, attempts = attempt + 1, error = %e, "Giving up after retries");
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                metrics::record_upstream_retry(operation);
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);

        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(16));
        assert_eq!(backoff_delay(6, base, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(64, base, max), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_for_stays_within_jitter_bounds() {
        let policy = RetryPolicy::default();

        for _ in 0..100 {
            let delay = policy.delay_for(1).as_millis();
            assert!((800..=1200).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_delay_for_respects_floor() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_millis(500));
        for _ in 0..100 {
            assert!(policy.delay_for(1) >= MIN_BACKOFF_DELAY);
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = retry_with_backoff(&fast_policy(5), "test", || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(AppError::Upstream(format!("failure {n}")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: AppResult<()> = retry_with_backoff(&fast_policy(4), "test", || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Upstream("always down".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Upstream(_))));
        // First attempt plus four retries
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: AppResult<()> = retry_with_backoff(&fast_policy(0), "test", || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Upstream("down".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
