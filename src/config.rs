//! Per-key configuration surface for every policy kind.
//!
//! Each policy resolves its settings through a [`KeyedConfig`]: an explicit
//! per-key entry wins, then an entry under the `"default"` key, then the
//! built-in base. All types derive serde so callers can load the whole
//! surface from JSON via [`EngineConfig`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Key consulted when no per-key entry exists.
pub const DEFAULT_KEY: &str = "default";

/// Errors produced when validating policy configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("failure_threshold must be > 0")]
    ZeroFailureThreshold,
    #[error("break_duration must be > 0 unless the breaker is disabled (got {0:?})")]
    ZeroBreakDuration(Duration),
    #[error("max_concurrency must be > 0")]
    ZeroMaxConcurrency,
    #[error("rate limiter capacity must be positive and finite (got {0})")]
    InvalidCapacity(f64),
    #[error("rate limiter refill_rate must be positive (got {0})")]
    InvalidRefillRate(f64),
    #[error("max_attempts must be > 0")]
    ZeroMaxAttempts,
    #[error("backoff_multiplier must be >= 1.0 and finite (got {0})")]
    InvalidBackoffMultiplier(f64),
    #[error("max_backoff ({max:?}) must be >= backoff_base ({base:?})")]
    MaxBackoffBelowBase { base: Duration, max: Duration },
    #[error("timeout duration must be > 0")]
    ZeroTimeout,
}

/// Circuit breaker settings for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit from Closed to Open.
    pub failure_threshold: usize,
    /// How long the circuit stays Open before allowing a half-open probe.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, break_duration: Duration::from_secs(30) }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that never trips. `usize::MAX` threshold disables the
    /// counting path entirely.
    pub fn disabled() -> Self {
        Self { failure_threshold: usize::MAX, break_duration: Duration::MAX }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        let disabled = self.failure_threshold == usize::MAX;
        if self.break_duration.is_zero() && !disabled {
            return Err(ConfigError::ZeroBreakDuration(self.break_duration));
        }
        Ok(())
    }
}

/// Bulkhead settings for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Calls allowed in flight at once.
    pub max_concurrency: usize,
    /// Additional callers allowed to wait for a slot. Zero means reject
    /// immediately at capacity.
    pub queue_capacity: usize,
    /// Longest a queued caller waits before being rejected.
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_capacity: 10,
            queue_timeout: Duration::from_secs(1),
        }
    }
}

impl BulkheadConfig {
    /// Effectively no concurrency cap. Tokio's semaphore caps permits well
    /// below `usize::MAX`, so use a large but safe bound.
    pub fn unlimited() -> Self {
        Self {
            max_concurrency: 1_000_000_000,
            queue_capacity: 0,
            queue_timeout: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroMaxConcurrency);
        }
        Ok(())
    }
}

/// Token bucket settings for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum tokens the bucket holds.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { capacity: 100.0, refill_rate: 10.0 }
    }
}

impl RateLimiterConfig {
    /// A bucket so large it never rejects.
    pub fn unlimited() -> Self {
        Self { capacity: f64::MAX, refill_rate: f64::MAX }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity.is_nan() || self.capacity <= 0.0 {
            return Err(ConfigError::InvalidCapacity(self.capacity));
        }
        if self.refill_rate.is_nan() || self.refill_rate <= 0.0 {
            return Err(ConfigError::InvalidRefillRate(self.refill_rate));
        }
        Ok(())
    }
}

/// Retry settings: exponential backoff with optional full jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, counting the initial call.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Growth factor applied per retry.
    pub backoff_multiplier: f64,
    /// Upper bound on any computed delay.
    pub max_backoff: Duration,
    /// Randomize each delay uniformly within `[0, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(self.backoff_multiplier));
        }
        if self.max_backoff < self.backoff_base {
            return Err(ConfigError::MaxBackoffBelowBase {
                base: self.backoff_base,
                max: self.max_backoff,
            });
        }
        Ok(())
    }
}

/// Timeout settings for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline for the wrapped operation.
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { duration: Duration::from_secs(30) }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Per-key lookup with a built-in base and an optional `"default"` override.
///
/// Resolution order: exact key, then the `"default"` entry, then `base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyedConfig<C> {
    base: C,
    #[serde(default = "HashMap::new")]
    per_key: HashMap<String, C>,
}

impl<C: Default> Default for KeyedConfig<C> {
    fn default() -> Self {
        Self { base: C::default(), per_key: HashMap::new() }
    }
}

impl<C> KeyedConfig<C> {
    /// Start from an explicit base configuration.
    pub fn new(base: C) -> Self {
        Self { base, per_key: HashMap::new() }
    }

    /// Set the configuration for one key, replacing any previous entry.
    pub fn set(&mut self, key: impl Into<String>, config: C) -> &mut Self {
        self.per_key.insert(key.into(), config);
        self
    }

    /// Builder-style variant of [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, config: C) -> Self {
        self.per_key.insert(key.into(), config);
        self
    }

    /// Resolve the configuration for `key`.
    pub fn resolve(&self, key: &str) -> &C {
        self.per_key
            .get(key)
            .or_else(|| self.per_key.get(DEFAULT_KEY))
            .unwrap_or(&self.base)
    }

    /// Validate the base and every per-key entry.
    pub fn validate_with(
        &self,
        check: impl Fn(&C) -> Result<(), ConfigError>,
    ) -> Result<(), ConfigError> {
        check(&self.base)?;
        for entry in self.per_key.values() {
            check(entry)?;
        }
        Ok(())
    }
}

/// The whole configuration surface, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub circuit_breaker: KeyedConfig<CircuitBreakerConfig>,
    #[serde(default)]
    pub bulkhead: KeyedConfig<BulkheadConfig>,
    #[serde(default)]
    pub rate_limiter: KeyedConfig<RateLimiterConfig>,
    #[serde(default)]
    pub retry: KeyedConfig<RetryConfig>,
    #[serde(default)]
    pub timeout: KeyedConfig<TimeoutConfig>,
}

impl EngineConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate_with(CircuitBreakerConfig::validate)?;
        self.bulkhead.validate_with(BulkheadConfig::validate)?;
        self.rate_limiter.validate_with(RateLimiterConfig::validate)?;
        self.retry.validate_with(RetryConfig::validate)?;
        self.timeout.validate_with(TimeoutConfig::validate)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_exact_key_then_default_then_base() {
        let mut keyed = KeyedConfig::new(TimeoutConfig { duration: Duration::from_secs(30) });
        keyed.set(DEFAULT_KEY, TimeoutConfig { duration: Duration::from_secs(10) });
        keyed.set("payments", TimeoutConfig { duration: Duration::from_secs(2) });

        assert_eq!(keyed.resolve("payments").duration, Duration::from_secs(2));
        assert_eq!(keyed.resolve("unknown").duration, Duration::from_secs(10));

        let bare: KeyedConfig<TimeoutConfig> = KeyedConfig::default();
        assert_eq!(bare.resolve("anything").duration, Duration::from_secs(30));
    }

    #[test]
    fn circuit_breaker_validation() {
        let bad = CircuitBreakerConfig { failure_threshold: 0, ..Default::default() };
        assert_eq!(bad.validate(), Err(ConfigError::ZeroFailureThreshold));

        let zero_break =
            CircuitBreakerConfig { failure_threshold: 3, break_duration: Duration::ZERO };
        assert!(matches!(zero_break.validate(), Err(ConfigError::ZeroBreakDuration(_))));

        assert!(CircuitBreakerConfig::disabled().validate().is_ok());
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn bulkhead_validation_rejects_zero_concurrency() {
        let bad = BulkheadConfig { max_concurrency: 0, ..Default::default() };
        assert_eq!(bad.validate(), Err(ConfigError::ZeroMaxConcurrency));
        assert!(BulkheadConfig::unlimited().validate().is_ok());
    }

    #[test]
    fn rate_limiter_validation_rejects_non_positive_values() {
        let bad = RateLimiterConfig { capacity: 0.0, refill_rate: 1.0 };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidCapacity(_))));
        let bad = RateLimiterConfig { capacity: 5.0, refill_rate: -1.0 };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidRefillRate(_))));
        assert!(RateLimiterConfig::unlimited().validate().is_ok());
    }

    #[test]
    fn retry_validation() {
        let bad = RetryConfig { max_attempts: 0, ..Default::default() };
        assert_eq!(bad.validate(), Err(ConfigError::ZeroMaxAttempts));

        let bad = RetryConfig { backoff_multiplier: 0.5, ..Default::default() };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidBackoffMultiplier(_))));

        let bad = RetryConfig {
            backoff_base: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::MaxBackoffBelowBase { .. })));
    }

    #[test]
    fn engine_config_round_trips_through_json() {
        let json = r#"{
            "circuit_breaker": {
                "base": { "failure_threshold": 3, "break_duration": { "secs": 5, "nanos": 0 } },
                "per_key": {
                    "payments": { "failure_threshold": 1, "break_duration": { "secs": 60, "nanos": 0 } }
                }
            },
            "rate_limiter": {
                "base": { "capacity": 5.0, "refill_rate": 1.0 }
            }
        }"#;

        let config: EngineConfig = serde_json::from_str(json).expect("valid config json");
        config.validate().expect("config validates");

        assert_eq!(config.circuit_breaker.resolve("payments").failure_threshold, 1);
        assert_eq!(config.circuit_breaker.resolve("other").failure_threshold, 3);
        assert_eq!(config.rate_limiter.resolve("anything").capacity, 5.0);
        // untouched sections fall back to built-in defaults
        assert_eq!(config.timeout.resolve("anything").duration, Duration::from_secs(30));

        let text = serde_json::to_string(&config).expect("serializes");
        let back: EngineConfig = serde_json::from_str(&text).expect("round trips");
        assert_eq!(back.circuit_breaker.resolve("payments").failure_threshold, 1);
    }
}
