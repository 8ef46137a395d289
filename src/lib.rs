#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Breakwater
//!
//! Resilience policies for async Rust, keyed per dependency: circuit
//! breakers, bulkheads, token-bucket rate limiting, retry with backoff, and
//! timeout enforcement, plus a read-side monitor that reduces policy state to
//! a health score and operator recommendations.
//!
//! Policies are keyed: `"payments-db"` and `"cache"` each get their own
//! circuit, permit pool, and token bucket, so one failing dependency never
//! degrades another's protection.
//!
//! ## Quick Start
//!
//! ```rust
//! use breakwater::{PolicyError, ResilienceStack};
//!
//! #[tokio::main]
//! async fn main() {
//!     let stack: ResilienceStack<std::io::Error> = ResilienceStack::builder()
//!         .build()
//!         .expect("valid configuration");
//!
//!     let result = stack
//!         .execute("payments-db", || async {
//!             // Your async operation here
//!             Ok::<_, PolicyError<std::io::Error>>(42)
//!         })
//!         .await;
//!     assert_eq!(result.unwrap(), 42);
//! }
//! ```
//!
//! Individual policies can also be used standalone; see [`CircuitBreaker`],
//! [`Bulkhead`], [`RateLimiter`], [`RetryPolicy`], and [`TimeoutEnforcer`].

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod jitter;
pub mod monitor;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;
pub mod stack;
pub mod store;
pub mod timeout;
pub mod tunable;

// Re-exports
pub use backoff::{Backoff, MAX_BACKOFF};
pub use bulkhead::{Bulkhead, BulkheadSnapshot};
pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, CircuitTransition};
pub use clock::{Clock, MonotonicClock};
pub use config::{
    BulkheadConfig, CircuitBreakerConfig, ConfigError, EngineConfig, KeyedConfig,
    RateLimiterConfig, RetryConfig, TimeoutConfig, DEFAULT_KEY,
};
pub use error::{PolicyError, MAX_RETRY_FAILURES};
pub use events::{PolicyEvent, PolicyKind};
pub use jitter::Jitter;
pub use monitor::{HealthWeights, Monitor, ResilienceReport};
pub use rate_limit::{InMemoryTokenStore, RateLimiter, RateSnapshot, TokenStore};
pub use retry::{RetryOverrides, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder};
pub use store::PolicyStore;
pub use timeout::{TimeoutEnforcer, TimeoutSnapshot};
pub use tunable::Tunable;
