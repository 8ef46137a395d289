//! Clock abstraction for time-based policy state.
//!
//! Circuit breakers compare timestamps, never absolute wall time, so a
//! millisecond tick from an injectable clock is enough. Tests drive
//! transitions by advancing a fake clock instead of sleeping.

use std::time::Instant;

/// Source of monotonic milliseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since some fixed origin.
    fn now_millis(&self) -> u64;
}

/// Production clock backed by `Instant`.
///
/// The origin is the moment the clock was created, so ticks reset on process
/// restart. All per-key state is in-memory and restarts with the process, so
/// relative ticks are sufficient.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
