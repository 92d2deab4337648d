//! Bounded retry with exponential backoff for transfer attempts.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use vitrine_core::defaults::{RETRY_BASE_DELAY_MS, UPLOAD_MAX_RETRIES};
use vitrine_core::logging::SUBSYSTEM_SYNC;
use vitrine_core::Result;

/// Retry policy: up to `max_retries` retries after the first attempt, waiting
/// `base_delay * 2^n` before retry `n` (1s, 2s, 4s by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: UPLOAD_MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
        }
    }
}

/// Final result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before the retry numbered `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retries are used up. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
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
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        subsystem = SUBSYSTEM_SYNC,
                        component = "retry",
                        op = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
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
