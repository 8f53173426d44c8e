//! Exponential backoff with optional jitter.

use std::time::Duration;

use rand::RngExt;

use crate::config::BackoffConfig;

/// Exponent cap so the step window never overflows.
const MAX_EXPONENT: u32 = 16;

/// Delay for attempt `n` is `min + rand[0, step * 2^n)`, capped at `max`.
///
/// With jitter disabled the full window is used instead of a random share of it.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    step: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(min_delay: Duration, max_delay: Duration, step: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            step,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait after the `attempt`-th failure (0-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt.min(MAX_EXPONENT)).unwrap_or(u32::MAX);
        let window = self.step.checked_mul(multiplier).unwrap_or(self.max_delay);

        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let extra_ms = if !self.jitter || window_ms == 0 {
            window_ms
        } else {
            rand::rng().random_range(0..window_ms)
        };

        self.min_delay
            .saturating_add(Duration::from_millis(extra_ms))
            .min(self.max_delay)
    }
}

impl From<&BackoffConfig> for ExponentialBackoff {
    fn from(config: &BackoffConfig) -> Self {
        let backoff = Self::new(config.min_delay(), config.max_delay(), config.step());
        if config.jitter {
            backoff
        } else {
            backoff.without_jitter()
        }
    }
}
