//! Failure taxonomy shared by every policy.
//!
//! Each policy layer either passes the inner layer's result through unchanged
//! or wraps it in its own rejection variant. Rejections never silently
//! succeed; the original operation error is preserved in [`PolicyError::Inner`]
//! and in the bounded failure window of [`PolicyError::RetriesExhausted`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Cap on failures retained inside `RetriesExhausted` so the error stays bounded.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type for all resilience policies.
#[derive(Debug, Clone, Error)]
pub enum PolicyError<E> {
    /// The circuit breaker rejected the call without invoking the operation.
    #[error("circuit '{key}' short-circuited ({consecutive_failures} consecutive failures, open for {open_for:?})")]
    ShortCircuited {
        /// Policy key of the circuit that rejected the call.
        key: String,
        /// Consecutive failure count observed when the call was rejected.
        consecutive_failures: usize,
        /// How long the circuit had been open at rejection time.
        open_for: Duration,
    },
    /// The bulkhead rejected the call: all slots busy and the queue was full,
    /// the queue wait timed out, or the wait was cancelled.
    #[error("bulkhead '{key}' rejected call ({active} active / max {max_concurrency}, {queued} queued / capacity {queue_capacity})")]
    BulkheadRejected {
        /// Policy key of the bulkhead that rejected the call.
        key: String,
        /// In-flight calls at rejection time.
        active: usize,
        /// Configured concurrency cap.
        max_concurrency: usize,
        /// Callers waiting in the queue at rejection time.
        queued: usize,
        /// Configured queue capacity.
        queue_capacity: usize,
    },
    /// The rate limiter had too few tokens; the call was rejected without waiting.
    #[error("rate limiter '{key}' rejected {requested} permit(s) ({available:.2} available)")]
    RateLimited {
        /// Policy key of the limiter that rejected the call.
        key: String,
        /// Permits the caller asked for.
        requested: u32,
        /// Tokens available after lazy refill.
        available: f64,
    },
    /// The operation exceeded its deadline. The operation itself may still be
    /// running; only the wait for it was abandoned.
    #[error("operation timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        /// Wall time elapsed before giving up.
        elapsed: Duration,
        /// The configured deadline.
        limit: Duration,
    },
    /// The retry executor gave up after exhausting all attempts.
    #[error("retries exhausted after {attempts} attempt(s); {} failure(s) recorded", .failures.len())]
    RetriesExhausted {
        /// Total attempts made, including the initial call.
        attempts: usize,
        /// The most recent failures, capped at [`MAX_RETRY_FAILURES`].
        failures: Arc<Vec<E>>,
    },
    /// The wrapped operation itself failed; the cause is preserved.
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E> PolicyError<E> {
    /// Build a `RetriesExhausted` error, keeping only the most recent
    /// [`MAX_RETRY_FAILURES`] failures.
    pub fn retries_exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let kept = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        PolicyError::RetriesExhausted { attempts, failures: Arc::new(kept) }
    }

    /// True if the circuit breaker rejected the call.
    pub fn is_short_circuited(&self) -> bool {
        matches!(self, Self::ShortCircuited { .. })
    }

    /// True if the bulkhead or rate limiter rejected the call without running it.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::BulkheadRejected { .. } | Self::RateLimited { .. })
    }

    /// True if the bulkhead rejected the call.
    pub fn is_bulkhead_rejected(&self) -> bool {
        matches!(self, Self::BulkheadRejected { .. })
    }

    /// True if the rate limiter rejected the call.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// True if the operation exceeded its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True if the retry executor exhausted its attempts.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// True if this wraps an operation error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Extract the operation error, if present.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the operation error, if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The last failure observed before retries were exhausted.
    pub fn last_failure(&self) -> Option<&E> {
        match self {
            Self::RetriesExhausted { failures, .. } => failures.last(),
            _ => None,
        }
    }

    /// Attempt count and recorded-failure count for `RetriesExhausted`.
    pub fn exhaustion_info(&self) -> Option<(usize, usize)> {
        match self {
            Self::RetriesExhausted { attempts, failures } => Some((*attempts, failures.len())),
            _ => None,
        }
    }

    /// Elapsed and limit durations for `Timeout`.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, limit } => Some((*elapsed, *limit)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    #[test]
    fn short_circuited_display_includes_key() {
        let err: PolicyError<DummyError> = PolicyError::ShortCircuited {
            key: "payments-db".into(),
            consecutive_failures: 5,
            open_for: Duration::from_secs(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("payments-db"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn bulkhead_display_includes_counts() {
        let err: PolicyError<DummyError> = PolicyError::BulkheadRejected {
            key: "cache".into(),
            active: 2,
            max_concurrency: 2,
            queued: 1,
            queue_capacity: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("cache"));
        assert!(msg.contains("2 active"));
    }

    #[test]
    fn retries_exhausted_caps_failure_window() {
        let failures: Vec<DummyError> = (0..25).map(|_| DummyError("x")).collect();
        let err = PolicyError::retries_exhausted(25, failures);
        match err {
            PolicyError::RetriesExhausted { attempts, failures } => {
                assert_eq!(attempts, 25);
                assert_eq!(failures.len(), MAX_RETRY_FAILURES);
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[test]
    fn retries_exhausted_keeps_most_recent_failures() {
        let failures = vec![DummyError("old"); MAX_RETRY_FAILURES]
            .into_iter()
            .chain(std::iter::once(DummyError("newest")))
            .collect();
        let err = PolicyError::retries_exhausted(MAX_RETRY_FAILURES + 1, failures);
        assert_eq!(err.last_failure().unwrap().0, "newest");
    }

    #[test]
    fn predicates_cover_all_variants() {
        let short: PolicyError<DummyError> = PolicyError::ShortCircuited {
            key: "k".into(),
            consecutive_failures: 1,
            open_for: Duration::ZERO,
        };
        assert!(short.is_short_circuited());
        assert!(!short.is_rejected());

        let bulkhead: PolicyError<DummyError> = PolicyError::BulkheadRejected {
            key: "k".into(),
            active: 1,
            max_concurrency: 1,
            queued: 0,
            queue_capacity: 0,
        };
        assert!(bulkhead.is_rejected());
        assert!(bulkhead.is_bulkhead_rejected());

        let limited: PolicyError<DummyError> =
            PolicyError::RateLimited { key: "k".into(), requested: 1, available: 0.0 };
        assert!(limited.is_rejected());
        assert!(limited.is_rate_limited());

        let timeout: PolicyError<DummyError> =
            PolicyError::Timeout { elapsed: Duration::from_secs(1), limit: Duration::from_secs(1) };
        assert!(timeout.is_timeout());
        assert_eq!(
            timeout.timeout_details(),
            Some((Duration::from_secs(1), Duration::from_secs(1)))
        );

        let exhausted: PolicyError<DummyError> = PolicyError::retries_exhausted(3, vec![]);
        assert!(exhausted.is_retries_exhausted());
        assert_eq!(exhausted.exhaustion_info(), Some((3, 0)));
    }

    #[test]
    fn inner_error_is_source() {
        let err = PolicyError::Inner(DummyError("cause"));
        assert!(err.is_inner());
        assert_eq!(err.source().map(|s| s.to_string()), Some("cause".to_string()));
        assert_eq!(err.into_inner().unwrap().0, "cause");
    }

    #[test]
    fn non_inner_variants_have_no_source() {
        let err: PolicyError<DummyError> =
            PolicyError::Timeout { elapsed: Duration::ZERO, limit: Duration::from_secs(1) };
        assert!(err.source().is_none());
    }
}
