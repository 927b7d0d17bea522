//! Retry delay strategy
//!
//! The delay for attempt `n` (0-indexed) is `first × factor^n`, clamped to
//! `max`. The default is a constant one second, matching the retry window of
//! [`RetryingWorker`](crate::worker::RetryingWorker).

use std::time::Duration;

/// Retry backoff strategy
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure
    pub first: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor per consecutive failure (`1.0` keeps the delay constant)
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl Backoff {
    /// Same delay after every failure
    pub fn fixed(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
        }
    }

    /// Exponentially growing delay, capped at `max`
    pub fn exponential(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Delay before retrying after `attempt` consecutive failures (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
