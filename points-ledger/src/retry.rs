//! Exponential backoff with jitter for conflicting or failed commits

use crate::config::RetryConfig;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retries retryable errors, surfaces everything else immediately
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    /// Strategy from configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Strategy with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Maximum retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Calculate delay for nth retry with exponential backoff + jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error
    /// or the retry budget is spent. The closure receives the attempt number,
    /// starting at 0.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.calculate_delay(attempt - 1);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = self.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying"
                );
                tokio::time::sleep(delay).await;
            }

            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempt, "Operation succeeded on retry"
                        );
                    }
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        attempts = self.config.max_retries + 1,
                        error = %e,
                        "Attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error.unwrap_or_else(|| {
            Error::Other(format!("{}: retries exhausted without error", operation_name))
        });
        warn!(operation = operation_name, error = %last_error, "Retries exhausted");
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_delay_is_capped() {
        let strategy = RetryStrategy::new(RetryConfig {
            max_retries: 10,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        });
        assert_eq!(strategy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(strategy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(strategy.calculate_delay(5), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast()
            .execute("op", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::ConcurrentConflict("users/u1".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast()
            .execute("op", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::VotingDisabled)
            })
            .await;
        assert!(matches!(result, Err(Error::VotingDisabled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast()
            .execute("op", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::StoreUnavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
