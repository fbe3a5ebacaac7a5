//! Retry policy for transient inference failures.
//!
//! The policy is a plain value. Jitter is passed in as a sample so delays are
//! deterministic under test.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before giving up (first try included).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// Exponential in `failures`, capped at `max_delay`. With jitter on, the
    /// delay is scaled into `[50%, 100%]` by `sample` (expected in `[0, 1)`).
    pub fn delay_for(&self, failures: u32, sample: f64) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        let raw = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if !self.jitter {
            return raw;
        }
        let scale = 0.5 + 0.5 * sample.clamp(0.0, 1.0);
        raw.mul_f64(scale)
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}
