//! Exponential backoff shared by the publisher retry loop and outbox rescheduling.

use std::time::Duration;

/// Exponents above this are clamped so the multiplication cannot overflow.
const MAX_EXPONENT: u32 = 40;

/// `unit * 2^exponent`, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// One "time unit" of the backoff curve.
    pub unit: Duration,

    /// Upper bound for any single delay. `None` means unbounded.
    pub max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            max_delay: None,
        }
    }

    /// Caps every delay at `max`.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(max);
        self
    }

    /// Returns `unit * 2^exponent`, saturating instead of overflowing.
    pub fn delay_for(&self, exponent: u32) -> Duration {
        let factor = 1u64 << exponent.min(MAX_EXPONENT);
        let millis = (self.unit.as_millis() as u64).saturating_mul(factor);
        let delay = Duration::from_millis(millis);

        match self.max_delay {
            Some(max) if delay > max => max,
            _ => delay,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Bounded retry policy for transient transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay to wait after the given 1-based attempt failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, ExponentialBackoff::default())
    }
}
