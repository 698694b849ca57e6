//! Backoff schedules for the discovery retry loop

use std::time::Duration;

/// Delay schedule between retries of a failing operation.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries
    Constant { delay: Duration },
    /// Exponentially increasing delay with optional cap
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    /// Create a constant backoff schedule
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create an exponential backoff schedule
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Set a maximum delay for exponential backoff
    pub fn with_max(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(cap);
        }
        self
    }

    /// Calculate the delay for a given attempt number (1-indexed)
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, max } => {
                let exponent = (attempt.saturating_sub(1)).min(u32::MAX as usize) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                let exp_delay =
                    base.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX));
                match max {
                    Some(cap) => exp_delay.min(*cap),
                    None => exp_delay,
                }
            }
        }
    }
}
