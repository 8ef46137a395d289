//! Read-side resilience monitor.
//!
//! Aggregates snapshots from every policy into one report, reduces the
//! report to a weighted health score in `[0, 1]`, and derives operator
//! recommendations. Everything works on immutable snapshots: taking a report
//! never blocks admission decisions, and scoring a report twice gives the
//! same answer.

use crate::bulkhead::{Bulkhead, BulkheadSnapshot};
use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::rate_limit::{InMemoryTokenStore, RateLimiter, RateSnapshot, TokenStore};
use crate::timeout::{TimeoutEnforcer, TimeoutSnapshot};
use crate::tunable::Tunable;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuits open longer than this draw a recommendation.
const LONG_OPEN: Duration = Duration::from_secs(60);
/// Bulkhead saturation at or above this draws a recommendation.
const SATURATION_WARN: f64 = 0.8;
/// Rate-limit rejection ratio above this draws a recommendation.
const REJECTION_WARN: f64 = 0.2;
/// Timeout ratio above this draws a recommendation.
const TIMEOUT_WARN: f64 = 0.1;

/// Weights applied to each degradation signal when scoring.
///
/// The weighted sum is clamped to `[0, 1]` and subtracted from 1, so each
/// signal can only lower the score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthWeights {
    pub open_circuits: f64,
    pub bulkhead_saturation: f64,
    pub rate_rejection: f64,
    pub timeouts: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            open_circuits: 0.40,
            bulkhead_saturation: 0.20,
            rate_rejection: 0.20,
            timeouts: 0.20,
        }
    }
}

/// Point-in-time view of every policy, sorted by key within each section.
#[derive(Debug, Clone)]
pub struct ResilienceReport {
    pub circuits: Vec<(String, CircuitSnapshot)>,
    pub bulkheads: Vec<(String, BulkheadSnapshot)>,
    pub rate_limiters: Vec<(String, RateSnapshot)>,
    pub timeouts: Vec<(String, TimeoutSnapshot)>,
}

impl ResilienceReport {
    /// Fraction of circuits currently refusing traffic (Open or Isolated).
    pub fn open_ratio(&self) -> f64 {
        if self.circuits.is_empty() {
            return 0.0;
        }
        let refusing = self
            .circuits
            .iter()
            .filter(|(_, s)| {
                matches!(s.state, CircuitState::Open | CircuitState::Isolated)
            })
            .count();
        refusing as f64 / self.circuits.len() as f64
    }

    /// Mean bulkhead saturation across keys.
    pub fn mean_saturation(&self) -> f64 {
        if self.bulkheads.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.bulkheads.iter().map(|(_, s)| s.saturation()).sum();
        sum / self.bulkheads.len() as f64
    }

    /// Rate-limit rejections over all acquisitions, across keys.
    pub fn rejection_ratio(&self) -> f64 {
        let (admitted, rejected) = self
            .rate_limiters
            .iter()
            .fold((0u64, 0u64), |(a, r), (_, s)| (a + s.admitted, r + s.rejected));
        let total = admitted + rejected;
        if total == 0 {
            return 0.0;
        }
        rejected as f64 / total as f64
    }

    /// Timed-out calls over all calls, across keys.
    pub fn timeout_ratio(&self) -> f64 {
        let (timeouts, total) = self
            .timeouts
            .iter()
            .fold((0u64, 0u64), |(t, n), (_, s)| (t + s.timeouts, n + s.total));
        if total == 0 {
            return 0.0;
        }
        timeouts as f64 / total as f64
    }
}

/// Read-side monitor over one set of policies.
///
/// Clones share the underlying policy state and the weight handle.
#[derive(Debug)]
pub struct Monitor<S = InMemoryTokenStore> {
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
    rate_limiter: RateLimiter<S>,
    timeouts: TimeoutEnforcer,
    weights: Tunable<HealthWeights>,
}

impl<S> Clone for Monitor<S> {
    fn clone(&self) -> Self {
        Self {
            breaker: self.breaker.clone(),
            bulkhead: self.bulkhead.clone(),
            rate_limiter: self.rate_limiter.clone(),
            timeouts: self.timeouts.clone(),
            weights: self.weights.clone(),
        }
    }
}

impl<S> Monitor<S>
where
    S: TokenStore + 'static,
{
    pub fn new(
        breaker: CircuitBreaker,
        bulkhead: Bulkhead,
        rate_limiter: RateLimiter<S>,
        timeouts: TimeoutEnforcer,
    ) -> Self {
        Self {
            breaker,
            bulkhead,
            rate_limiter,
            timeouts,
            weights: Tunable::new(HealthWeights::default()),
        }
    }

    /// Replace the scoring weights at runtime.
    pub fn set_weights(&self, weights: HealthWeights) {
        self.weights.set(weights);
    }

    /// Snapshot every policy.
    pub fn report(&self) -> ResilienceReport {
        ResilienceReport {
            circuits: self.breaker.all_states(),
            bulkheads: self.bulkhead.all_snapshots(),
            rate_limiters: self.rate_limiter.all_snapshots(),
            timeouts: self.timeouts.all_snapshots(),
        }
    }

    /// Reduce a report to a health score in `[0, 1]`; 1.0 is fully healthy.
    ///
    /// `score = 1 − clamp(w₁·open_ratio + w₂·saturation + w₃·rejections + w₄·timeouts)`
    ///
    /// Pure over the report: scoring is repeatable, and any increase in a
    /// degradation signal can only lower the score.
    pub fn score(&self, report: &ResilienceReport) -> f64 {
        let weights = self.weights.get();
        let penalty = weights.open_circuits * report.open_ratio()
            + weights.bulkhead_saturation * report.mean_saturation()
            + weights.rate_rejection * report.rejection_ratio()
            + weights.timeouts * report.timeout_ratio();
        1.0 - penalty.clamp(0.0, 1.0)
    }

    /// Derive operator guidance from a report.
    pub fn recommendations(&self, report: &ResilienceReport) -> Vec<String> {
        let mut out = Vec::new();

        for (key, circuit) in &report.circuits {
            match circuit.state {
                CircuitState::Isolated => {
                    out.push(format!(
                        "circuit '{key}' is isolated; traffic will not resume until it is reset"
                    ));
                }
                CircuitState::Open => {
                    if circuit.open_for.unwrap_or(Duration::ZERO) > LONG_OPEN {
                        out.push(format!(
                            "circuit '{key}' has been open for over {}s; the dependency looks unhealthy",
                            LONG_OPEN.as_secs()
                        ));
                    }
                }
                _ => {}
            }
        }

        for (key, bulkhead) in &report.bulkheads {
            if bulkhead.saturation() >= SATURATION_WARN {
                out.push(format!(
                    "bulkhead '{key}' is {:.0}% saturated ({} of {} slots); consider raising max_concurrency",
                    bulkhead.saturation() * 100.0,
                    bulkhead.active,
                    bulkhead.max_concurrency
                ));
            }
        }

        for (key, rate) in &report.rate_limiters {
            if rate.rejection_ratio() > REJECTION_WARN {
                out.push(format!(
                    "rate limiter '{key}' rejected {:.0}% of acquisitions; callers exceed the configured rate",
                    rate.rejection_ratio() * 100.0
                ));
            }
        }

        for (key, timeouts) in &report.timeouts {
            if timeouts.timeout_ratio() > TIMEOUT_WARN {
                out.push(format!(
                    "'{key}' timed out on {:.0}% of calls; the deadline may be too tight or the dependency too slow",
                    timeouts.timeout_ratio() * 100.0
                ));
            }
        }

        out
    }
}
