//! Jitter strategies for retry delays.
//!
//! Randomizing backoff keeps independent callers from retrying in lockstep
//! after a shared dependency hiccups. `Full` draws uniformly from
//! `[0, delay]` and is the strategy behind the `jitter: true` retry config
//! flag; `Equal` keeps a floor of half the delay.

use rand::{rng, Rng};
use std::time::Duration;

/// How to randomize a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Use the exact computed delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    /// Map the retry config's boolean flag onto a strategy.
    pub fn from_flag(jitter: bool) -> Self {
        if jitter {
            Jitter::Full
        } else {
            Jitter::None
        }
    }

    /// Randomize `delay` with the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Randomize `delay` with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = Self::saturated_millis(delay);
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
        }
    }

    fn saturated_millis(delay: Duration) -> u64 {
        delay.as_millis().try_into().unwrap_or(u64::MAX)
    }
}
