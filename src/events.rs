//! Structured notifications from the policy layers.
//!
//! Each layer can publish its decisions on an unbounded channel: admissions
//! and rejections from the gating layers, circuit state transitions, and
//! deadline hits. Sends never block an admission decision and a dropped
//! receiver is ignored, so a slow or absent consumer cannot slow a call path.
//!
//! Wire a channel into a whole stack with
//! [`ResilienceStackBuilder::events`](crate::ResilienceStackBuilder::events),
//! or into an individual layer with its `with_events` method.

use crate::circuit_breaker::CircuitTransition;

/// Which policy layer produced an event. Deadline hits have their own
/// [`PolicyEvent::TimedOut`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    CircuitBreaker,
    Bulkhead,
    RateLimiter,
}

/// One decision made by a policy layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// A circuit changed state.
    CircuitTransition(CircuitTransition),
    /// A call passed the named layer's admission check.
    Admitted { policy: PolicyKind, key: String },
    /// A call was turned away by the named layer without running.
    Rejected { policy: PolicyKind, key: String },
    /// An admitted call exceeded its deadline.
    TimedOut { key: String },
}
