//! Keyed token-bucket rate limiter.
//!
//! Each key owns one bucket. Tokens refill lazily at `refill_rate` per
//! second, computed from the elapsed time since the last acquisition, up to
//! `capacity`. Acquisition never waits: either enough tokens are available
//! now or the call is rejected.
//!
//! Bucket state lives behind the [`TokenStore`] trait so the same limiter
//! logic can run against an in-memory map or a distributed backend. Updates
//! use optimistic concurrency: read, compute, commit-if-unchanged, with a
//! bounded number of retries under contention.

use crate::config::{ConfigError, KeyedConfig, RateLimiterConfig};
use crate::error::PolicyError;
use crate::events::{PolicyEvent, PolicyKind};
use crate::store::PolicyStore;
use crate::tunable::Tunable;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;

/// Attempts to commit a bucket update before denying on contention.
const CAS_ATTEMPTS: usize = 3;

/// Storage interface for bucket state, keyed by policy key.
///
/// The value is `(tokens, last_updated_nanos)`. Implementations must provide
/// compare-and-set semantics on the timestamp so concurrent acquirers cannot
/// both spend the same tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the current `(tokens, last_updated_nanos)` for a bucket.
    async fn read_bucket(&self, key: &str) -> Result<Option<(f64, u64)>, Self::Error>;

    /// Commit a bucket update if the stored timestamp still equals
    /// `prev_updated_at`. `None` asserts the caller observed no bucket, so
    /// the commit succeeds only while the bucket is still absent.
    ///
    /// Returns `Ok(false)` when a race was detected and the caller should
    /// re-read.
    async fn commit_bucket(
        &self,
        key: &str,
        tokens: f64,
        updated_at: u64,
        prev_updated_at: Option<u64>,
    ) -> Result<bool, Self::Error>;
}

/// In-memory [`TokenStore`] backed by a mutex-guarded map.
#[derive(Default, Clone, Debug)]
pub struct InMemoryTokenStore {
    buckets: Arc<Mutex<HashMap<String, (f64, u64)>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    type Error = std::convert::Infallible;

    async fn read_bucket(&self, key: &str) -> Result<Option<(f64, u64)>, Self::Error> {
        let guard = self.buckets.lock().expect("token store lock poisoned");
        Ok(guard.get(key).copied())
    }

    async fn commit_bucket(
        &self,
        key: &str,
        tokens: f64,
        updated_at: u64,
        prev_updated_at: Option<u64>,
    ) -> Result<bool, Self::Error> {
        let mut guard = self.buckets.lock().expect("token store lock poisoned");

        // Timestamps alone cannot distinguish two first-users that read the
        // same clock, so absence is checked structurally.
        let unchanged = match (guard.get(key), prev_updated_at) {
            (None, None) => true,
            (Some(&(_, current_ts)), Some(prev)) => current_ts == prev,
            _ => false,
        };
        if !unchanged {
            return Ok(false);
        }

        guard.insert(key.to_string(), (tokens, updated_at));
        Ok(true)
    }
}

/// Read-only view of one bucket's counters, for monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    pub capacity: f64,
    pub refill_rate: f64,
    /// Acquisitions granted since the bucket was first used.
    pub admitted: u64,
    /// Acquisitions denied since the bucket was first used.
    pub rejected: u64,
}

impl RateSnapshot {
    /// Fraction of acquisitions denied, in `[0, 1]`.
    pub fn rejection_ratio(&self) -> f64 {
        let total = self.admitted + self.rejected;
        if total == 0 {
            return 0.0;
        }
        self.rejected as f64 / total as f64
    }
}

#[derive(Debug)]
struct RateRecord {
    params: Tunable<RateLimiterConfig>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateRecord {
    fn new(config: RateLimiterConfig) -> Self {
        Self {
            params: Tunable::new(config),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

enum Decision {
    Allowed { remaining: f64 },
    Denied { available: f64 },
}

/// Keyed rate limiter guarding async operations.
///
/// Clones share the same buckets and counters via `Arc`.
#[derive(Debug)]
pub struct RateLimiter<S = InMemoryTokenStore> {
    tokens: Arc<S>,
    records: Arc<PolicyStore<RateRecord>>,
    config: Arc<KeyedConfig<RateLimiterConfig>>,
    events: Option<UnboundedSender<PolicyEvent>>,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            tokens: self.tokens.clone(),
            records: self.records.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
        }
    }
}

impl RateLimiter<InMemoryTokenStore> {
    /// Create a limiter with in-memory bucket state, validating every entry.
    pub fn new(config: KeyedConfig<RateLimiterConfig>) -> Result<Self, ConfigError> {
        Self::with_store(InMemoryTokenStore::new(), config)
    }
}

impl<S> RateLimiter<S>
where
    S: TokenStore + 'static,
{
    /// Create a limiter backed by an explicit token store.
    pub fn with_store(
        store: S,
        config: KeyedConfig<RateLimiterConfig>,
    ) -> Result<Self, ConfigError> {
        config.validate_with(RateLimiterConfig::validate)?;
        Ok(Self {
            tokens: Arc::new(store),
            records: Arc::new(PolicyStore::new()),
            config: Arc::new(config),
            events: None,
        })
    }

    /// Publish every admission and rejection on `sender`. The send never
    /// blocks; a dropped receiver is ignored.
    pub fn with_events(mut self, sender: UnboundedSender<PolicyEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Try to take `permits` tokens from the bucket for `key`. Never waits.
    pub async fn try_acquire(&self, key: &str, permits: u32) -> bool {
        matches!(self.acquire(key, permits).await, Decision::Allowed { .. })
    }

    /// Execute `operation` if one token is available for `key`.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.execute_weighted(key, 1, operation).await
    }

    /// Execute `operation` if `permits` tokens are available for `key`.
    /// Expensive calls can be weighted to consume more of the budget.
    pub async fn execute_weighted<T, E, Fut, Op>(
        &self,
        key: &str,
        permits: u32,
        operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        match self.acquire(key, permits).await {
            Decision::Allowed { remaining } => {
                tracing::trace!(key, requested = permits, remaining, "rate limit admitted");
                operation().await
            }
            Decision::Denied { available } => {
                Err(PolicyError::RateLimited { key: key.to_string(), requested: permits, available })
            }
        }
    }

    /// Replace the bucket parameters for `key` at runtime. In-flight
    /// acquisitions finish with the parameters they read.
    pub fn update(&self, key: &str, config: RateLimiterConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let record = self.record(key);
        tracing::info!(
            key,
            capacity = config.capacity,
            refill_rate = config.refill_rate,
            "rate limiter parameters updated"
        );
        record.params.set(config);
        Ok(())
    }

    /// Snapshot the bucket counters for `key`, if it has been used.
    pub fn snapshot(&self, key: &str) -> Option<RateSnapshot> {
        self.records.get(key).map(|record| Self::snapshot_record(&record))
    }

    /// Snapshot every bucket, sorted by key.
    pub fn all_snapshots(&self) -> Vec<(String, RateSnapshot)> {
        self.records
            .snapshot()
            .into_iter()
            .map(|(key, record)| (key, Self::snapshot_record(&record)))
            .collect()
    }

    fn snapshot_record(record: &RateRecord) -> RateSnapshot {
        let params = record.params.get();
        RateSnapshot {
            capacity: params.capacity,
            refill_rate: params.refill_rate,
            admitted: record.admitted.load(Ordering::Acquire),
            rejected: record.rejected.load(Ordering::Acquire),
        }
    }

    fn record(&self, key: &str) -> Arc<RateRecord> {
        self.records.get_or_insert_with(key, || RateRecord::new(self.config.resolve(key).clone()))
    }

    async fn acquire(&self, key: &str, permits: u32) -> Decision {
        let record = self.record(key);
        let params = record.params.get();
        let cost = permits as f64;
        let now = now_nanos();

        for _ in 0..CAS_ATTEMPTS {
            let (current_tokens, last_updated, prev) = match self.tokens.read_bucket(key).await {
                Ok(Some((tokens, updated))) => (tokens, updated, Some(updated)),
                // First use: a full bucket, committed only if still absent.
                Ok(None) => (params.capacity, now, None),
                Err(e) => {
                    tracing::warn!(key, error = %e, "token store read failed, denying");
                    return self.deny(key, &record, 0.0);
                }
            };

            let elapsed_secs = now.saturating_sub(last_updated) as f64 / 1_000_000_000.0;
            let refilled =
                (current_tokens + elapsed_secs * params.refill_rate).min(params.capacity);

            if refilled < cost {
                tracing::debug!(key, requested = permits, available = refilled, "rate limited");
                return self.deny(key, &record, refilled);
            }

            let remaining = refilled - cost;
            match self.tokens.commit_bucket(key, remaining, now, prev).await {
                Ok(true) => {
                    record.admitted.fetch_add(1, Ordering::AcqRel);
                    self.send(PolicyEvent::Admitted {
                        policy: PolicyKind::RateLimiter,
                        key: key.to_string(),
                    });
                    return Decision::Allowed { remaining };
                }
                // Race detected; re-read and try again.
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(key, error = %e, "token store write failed, denying");
                    return self.deny(key, &record, refilled);
                }
            }
        }

        // Persistent contention: deny rather than spin.
        tracing::debug!(key, "token store contention, denying");
        self.deny(key, &record, 0.0)
    }

    fn deny(&self, key: &str, record: &RateRecord, available: f64) -> Decision {
        record.rejected.fetch_add(1, Ordering::AcqRel);
        self.send(PolicyEvent::Rejected { policy: PolicyKind::RateLimiter, key: key.to_string() });
        Decision::Denied { available }
    }

    fn send(&self, event: PolicyEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}

fn now_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}
