//! Sleep abstraction so retry backoff can be tested without real delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cooperative delay used between retry attempts.
///
/// Implementations must yield rather than block: sleeping must never tie up
/// a shared worker thread.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Return a future that completes after `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper delegating to `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that completes immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that records requested delays instead of sleeping.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    recorded: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// All delays requested so far, in order.
    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded.lock().expect("recording sleeper lock poisoned").clone()
    }

    /// Number of sleeps requested so far.
    pub fn count(&self) -> usize {
        self.recorded.lock().expect("recording sleeper lock poisoned").len()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.recorded.lock().expect("recording sleeper lock poisoned").push(duration);
        Box::pin(async {})
    }
}
