//! Bounded retry with exponential backoff

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for transient storage failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Backoff multiplier applied per retry
    pub multiplier: f64,
    /// Ceiling on a single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let scaled = self.base_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        Duration::from_millis(scaled as u64).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, it returns a non-retryable error, or
/// attempts are exhausted. The final error is returned unchanged.
pub async fn retry<F, Fut, T>(name: &str, config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<Error> = None;

    for attempt in 1..=config.max_attempts.max(1) {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for(attempt - 1);
                warn!(
                    operation = name,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "retryable failure, backing off"
                );
                last_error = Some(err);
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Invariant(format!("retry loop for {} made no attempt", name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1));

        let result = retry("test-op", &config, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Storage("connection reset".to_string()))
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
    async fn does_not_retry_validation_errors() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1));

        let result: Result<()> = retry("test-op", &config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Validation("bad input".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1));

        let result: Result<()> = retry("test-op", &config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Conflict("duplicate key".to_string())) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().category(), "conflict");
    }
}
