//! Per-cycle failure accounting and sleep computation.
//!
//! One successful poll resets the failure count and returns the base
//! interval. The k-th consecutive failure sleeps `base × 2^(k−1)`, capped at
//! five minutes. The sleep itself is performed by the poller, racing a
//! cancellation token, so shutdown latency is never bounded by a backoff.

use std::time::Duration;

/// Ceiling for backoff sleeps.
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Exponential-backoff controller for the poll loop.
#[derive(Debug)]
pub struct BackoffController {
    base: Duration,
    consecutive_failures: u32,
}

impl BackoffController {
    pub fn new(base: Duration) -> Self {
        BackoffController {
            base,
            consecutive_failures: 0,
        }
    }

    /// Records a cycle outcome and returns the next sleep.
    pub fn on_cycle_outcome(&mut self, success: bool) -> Duration {
        if success {
            self.consecutive_failures = 0;
            return self.base;
        }

        self.consecutive_failures += 1;
        let factor = 2u32.saturating_pow(self.consecutive_failures - 1);
        self.base.saturating_mul(factor).min(BACKOFF_CAP)
    }

    /// Clears the failure count without producing a sleep (used when
    /// hibernation exits and normal polling resumes).
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
