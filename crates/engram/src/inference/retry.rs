//! Bounded retries with exponential backoff

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::InferenceConfig;
use crate::error::{EngramError, Result};

/// Time bound and retry budget applied to one logical call.
///
/// Every attempt is capped at `timeout`. Only transient errors
/// (`TransientInfra`, `Timeout`) are retried; the delay doubles after each
/// failed attempt up to `max_backoff`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            timeout,
            max_retries,
            initial_backoff,
            max_backoff: initial_backoff.saturating_mul(16),
        }
    }

    /// Policy for embedding calls
    pub fn embedding(config: &InferenceConfig) -> Self {
        Self::from_config(config, config.embed_timeout_secs)
    }

    /// Policy for summarization calls
    pub fn summarization(config: &InferenceConfig) -> Self {
        Self::from_config(config, config.summarize_timeout_secs)
    }

    fn from_config(config: &InferenceConfig, timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.initial_backoff;
        let mut attempt = 0;

        loop {
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(EngramError::Timeout(format!(
                    "{operation} exceeded {:?}",
                    self.timeout
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "{operation} failed on attempt {}/{}, retrying in {:?}: {e}",
                        attempt,
                        self.max_retries + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2).min(self.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::embedding(&InferenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(50), max_retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast_policy(2)
            .run("embed", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(EngramError::TransientInfra("connection reset".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_content_rejection() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = fast_policy(3)
            .run("summarize", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(EngramError::ContentRejected("policy".into())) }
            })
            .await;

        assert!(matches!(result, Err(EngramError::ContentRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_reported_as_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = fast_policy(1)
            .run("embed", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(EngramError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_policies_from_config() {
        let config = InferenceConfig::default();
        assert_eq!(RetryPolicy::embedding(&config).timeout, Duration::from_secs(10));
        assert_eq!(RetryPolicy::summarization(&config).timeout, Duration::from_secs(60));
        assert_eq!(RetryPolicy::embedding(&config).max_retries, 2);
    }
}
