//! Exponential backoff with jitter, applied once at `ToolManager::execute_tool`
//! (spec §7's two retry layers are consolidated here).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// `maxAttempts=3, base=100ms, cap=2s, jitter=±20%` per spec defaults.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the `(attempt+1)`-th retry (0-indexed): exponential,
    /// capped, then jittered by ±`jitter` fraction.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jitter_range = capped * self.jitter;
        let delta = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((capped + delta).max(0.0) as u64)
    }

    /// Run `operation` until it succeeds, a non-retryable error is returned,
    /// or `maxAttempts` is exhausted. Protocol errors and circuit-open
    /// rejections are never retried — see `GatewayError::is_retryable`.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> crate::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff_for_attempt(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_secs(2)); // capped
    }

    #[tokio::test]
    async fn test_retries_up_to_max_attempts_then_fails() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);
        let result: crate::Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Timeout("srv".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_succeeds_without_retrying_further_on_first_success() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, GatewayError>(42) }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_is_not_retried() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let result: crate::Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Protocol("srv".into(), "tool error".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
