//! Exponential reconnect backoff.

use std::time::Duration;

/// Computes `base * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the next attempt, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over from the base delay after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap = self.max.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}
