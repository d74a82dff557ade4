use std::future::Future;
use std::time::Duration;

use tracing::warn;

use quire_common::{PipelineSettings, Result};

/// Fixed-delay retry: up to `1 + max_retries` attempts, no backoff.
/// Errors that are not retryable end the loop on the attempt they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            delay: settings.retry_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, step: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts() => {
                    warn!(step, attempt, error = %e, "Step attempt failed, retrying");
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}
