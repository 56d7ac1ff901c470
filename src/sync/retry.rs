// Bounded retry with exponential backoff for store calls and version
// conflicts. Only errors the caller classifies as retryable are retried.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::observability::EngineMetrics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delays between attempts: base, 2×base, 4×base … capped at max.
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let backoff = ExponentialBackoff::from_millis(2)
            .factor((self.base_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .take(self.max_attempts.saturating_sub(1));
        if self.jitter {
            Box::new(backoff.map(jitter))
        } else {
            Box::new(backoff)
        }
    }
}

/// The last error of a retried call and how many attempts were made.
#[derive(Debug, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    /// Count every retry (attempts beyond the first) in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `action` until it succeeds, fails with an error `retryable`
    /// rejects, or the attempts are used up.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        label: &str,
        mut action: F,
        mut retryable: C,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnMut(&E) -> bool,
    {
        let attempts = AtomicUsize::new(0);
        let result = RetryIf::spawn(
            self.config.delays(),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                action()
            },
            |err: &E| {
                let retry = retryable(err);
                if retry {
                    warn!(label, error = %err, "Retryable failure");
                }
                retry
            },
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        if attempts > 1 {
            if let Some(metrics) = &self.metrics {
                metrics.record_retries((attempts - 1) as u64);
            }
        }

        result.map_err(|error| {
            debug!(label, attempts, error = %error, "Giving up");
            RetryError { error, attempts }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        })
    }

    #[tokio::test]
    async fn test_retry_success_after_failure() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = fast(3)
            .run(
                "test",
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky")
                    } else {
                        Ok("success")
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let metrics = Arc::new(EngineMetrics::new());
        let err = fast(3)
            .with_metrics(metrics.clone())
            .run("test", || async { Err::<(), _>("down") }, |_| true)
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(metrics.get_stats().retries, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let err = fast(5)
            .run("test", || async { Err::<(), _>("fatal") }, |_| false)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.error, "fatal");
    }
}
