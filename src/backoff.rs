//! Backoff schedule for the retry executor.
//!
//! The delay before retry `n` (1-indexed) is
//! `min(max_backoff, base * multiplier^(n-1))`. Attempt `0` is the initial
//! call and carries no delay. A multiplier of `1.0` gives a fixed delay.
//! Computations that would overflow saturate at [`MAX_BACKOFF`].

use crate::config::{ConfigError, RetryConfig};
use std::time::Duration;

/// Saturation bound for computed delays (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff schedule with a cap.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    /// Build a schedule, validating that `multiplier >= 1.0` and `max >= base`.
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Result<Self, ConfigError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(multiplier));
        }
        if max < base {
            return Err(ConfigError::MaxBackoffBelowBase { base, max });
        }
        Ok(Self { base, multiplier, max })
    }

    /// Fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self { base: delay, multiplier: 1.0, max: delay.max(Duration::from_nanos(1)) }
    }

    /// Doubling delay starting at `base`, capped at [`MAX_BACKOFF`].
    pub fn exponential(base: Duration) -> Self {
        Self { base, multiplier: 2.0, max: MAX_BACKOFF }
    }

    /// Replace the cap. Errors if `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, ConfigError> {
        if max < self.base {
            return Err(ConfigError::MaxBackoffBelowBase { base: self.base, max });
        }
        self.max = max;
        Ok(self)
    }

    /// Delay before the given attempt. Attempt `0` is the initial call.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // powi saturates to infinity long before i32::MAX; clamping the
        // exponent keeps the cast sound for absurd attempt counts.
        let exponent = attempt.saturating_sub(1).min(u16::MAX as usize) as i32;
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max.min(MAX_BACKOFF);
        if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
            return cap;
        }
        Duration::from_secs_f64(scaled)
    }
}

impl TryFrom<&RetryConfig> for Backoff {
    type Error = ConfigError;

    fn try_from(config: &RetryConfig) -> Result<Self, ConfigError> {
        Backoff::new(config.backoff_base, config.backoff_multiplier, config.max_backoff)
    }
}
