//! Retry policy shared by every remote call
//!
//! Throttled calls back off exponentially from `base_delay`, never waiting
//! less than the server's `Retry-After` hint. Transient faults back off
//! linearly. Both stop after `max_attempts` total attempts.

use super::stats::RunStats;
use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Cap for computed delays; a larger server hint still wins
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the next attempt, given the zero-based index of the
    /// attempt that just failed
    pub fn delay_for(&self, attempt: u32, err: &ApiError) -> Duration {
        let base = self.base_delay_ms;
        let cap = Duration::from_millis(self.max_delay_ms);

        match err {
            ApiError::Throttled { retry_after } => {
                let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
                let computed = Duration::from_millis(base.saturating_mul(factor)).min(cap);
                match retry_after {
                    Some(hint) => computed.max(*hint),
                    None => computed,
                }
            }
            _ => {
                let linear = base.saturating_mul(u64::from(attempt) + 1);
                Duration::from_millis(linear).min(cap)
            }
        }
    }

    /// Run `op` until it succeeds, fails permanently or the attempt bound
    /// is reached. `op` receives the zero-based attempt index.
    pub async fn run<T, F, Fut>(&self, label: &str, stats: &RunStats, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt + 1 >= attempts {
                tracing::warn!("{}: giving up after {} attempts: {}", label, attempts, err);
                return Err(ApiError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt, &err);
            if err.is_throttle() {
                stats.record_throttle_retry();
            } else {
                stats.record_transient_retry();
            }
            tracing::debug!(
                "{}: attempt {} failed ({}), retrying in {:?}",
                label,
                attempt + 1,
                err,
                delay
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn test_throttle_delay_is_exponential() {
        let p = policy();
        let err = ApiError::Throttled { retry_after: None };
        assert_eq!(p.delay_for(0, &err), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, &err), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, &err), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let p = policy();
        let err = ApiError::Throttled {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(p.delay_for(0, &err), Duration::from_secs(3));
        // computed delay overtakes the hint eventually
        assert_eq!(p.delay_for(5, &err), Duration::from_millis(3200));
        // a hint larger than the cap is still honored
        let err = ApiError::Throttled {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(p.delay_for(0, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_transient_delay_is_linear_and_capped() {
        let p = policy();
        let err = ApiError::Transient("timeout".into());
        assert_eq!(p.delay_for(0, &err), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, &err), Duration::from_millis(300));
        assert_eq!(p.delay_for(500, &err), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_forever_makes_exactly_max_attempts() {
        let p = policy();
        let stats = RunStats::new();
        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());

        let result: Result<(), ApiError> = p
            .run("always-throttled", &stats, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(Instant::now());
                async { Err(ApiError::Throttled { retry_after: None }) }
            })
            .await;

        assert!(matches!(result, Err(ApiError::Exhausted { attempts: 5, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(stats.snapshot().throttle_retries, 4);

        let seen = seen.lock().unwrap();
        let gaps: Vec<Duration> = seen.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 4);
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let p = policy();
        let stats = RunStats::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), ApiError> = p
            .run("forbidden", &stats, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::from_status(403, None, "denied")) }
            })
            .await;

        assert!(matches!(result, Err(ApiError::Rejected { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_fault() {
        let p = policy();
        let stats = RunStats::new();

        let result = p
            .run("flaky", &stats, |attempt| async move {
                if attempt < 2 {
                    Err(ApiError::Transient("HTTP 503".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(stats.snapshot().transient_retries, 2);
    }
}
