//! Exponential-backoff retry for transient adapter errors.
//!
//! Transient errors (rate limits, isolated 5xx responses) are retried inside
//! the adapter so the core never sees a single flaky request. Only transient
//! errors are retried; everything else is returned immediately. When retries
//! are exhausted, server-side failures are escalated to the unreachable kind
//! so the poller trips hibernation instead of hammering a dead platform.

use std::future::Future;
use std::time::Duration;

use super::error::{AdapterError, AdapterErrorKind};

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Default retry configuration: 3 retries with 2s, 4s, 8s delays.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(16),
    };

    /// Computes the delay for the given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Executes an async adapter operation, retrying transient errors.
///
/// Non-transient errors are returned on the first occurrence. Exhausted
/// transient errors are escalated via [`AdapterError::escalate_exhausted`].
pub async fn with_retry<T, F, Fut>(config: RetryConfig, mut operation: F) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind == AdapterErrorKind::Transient => {
                if attempt >= config.max_retries {
                    return Err(e.escalate_exhausted());
                }
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying transient adapter error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
