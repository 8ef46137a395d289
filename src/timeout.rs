//! Keyed timeout enforcement.
//!
//! Wraps an operation in a deadline via `tokio::time::timeout`. When the
//! deadline fires the wrapped future is dropped, which cancels it at its next
//! await point; work that blocks without yielding cannot be interrupted, so
//! cancellation is best-effort. Per-key counters feed the monitor's timeout
//! ratio.

use crate::config::{ConfigError, KeyedConfig, TimeoutConfig};
use crate::error::PolicyError;
use crate::events::PolicyEvent;
use crate::store::PolicyStore;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Read-only view of one key's timeout counters, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutSnapshot {
    /// Calls executed under this key's deadline.
    pub total: u64,
    /// Calls that hit the deadline.
    pub timeouts: u64,
    /// Calls that completed successfully within the deadline.
    pub successes: u64,
    /// Mean wall time of successful calls, if any completed.
    pub average_success: Option<Duration>,
}

impl TimeoutSnapshot {
    /// Fraction of calls that timed out, in `[0, 1]`.
    pub fn timeout_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.timeouts as f64 / self.total as f64
    }
}

#[derive(Debug, Default)]
struct TimeoutRecord {
    total: AtomicU64,
    timeouts: AtomicU64,
    successes: AtomicU64,
    success_micros: AtomicU64,
}

/// Keyed timeout enforcer.
///
/// Clones share the same per-key counters via `Arc`.
#[derive(Debug, Clone)]
pub struct TimeoutEnforcer {
    store: Arc<PolicyStore<TimeoutRecord>>,
    config: Arc<KeyedConfig<TimeoutConfig>>,
    events: Option<UnboundedSender<PolicyEvent>>,
}

impl TimeoutEnforcer {
    /// Create an enforcer from a per-key config surface, validating every entry.
    pub fn new(config: KeyedConfig<TimeoutConfig>) -> Result<Self, ConfigError> {
        config.validate_with(TimeoutConfig::validate)?;
        Ok(Self { store: Arc::new(PolicyStore::new()), config: Arc::new(config), events: None })
    }

    /// Publish every deadline hit on `sender`. The send never blocks; a
    /// dropped receiver is ignored.
    pub fn with_events(mut self, sender: UnboundedSender<PolicyEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Execute `operation` under the configured deadline for `key`.
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
        let limit = self.config.resolve(key).duration;
        self.execute_with(key, limit, operation).await
    }

    /// Execute `operation` under an explicit deadline, bypassing the config.
    pub async fn execute_with<T, E, Fut, Op>(
        &self,
        key: &str,
        limit: Duration,
        operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let record = self.store.get_or_insert_with(key, TimeoutRecord::default);
        record.total.fetch_add(1, Ordering::AcqRel);

        let started = Instant::now();
        match tokio::time::timeout(limit, operation()).await {
            Ok(result) => {
                if result.is_ok() {
                    let micros = started.elapsed().as_micros().min(u64::MAX as u128) as u64;
                    record.successes.fetch_add(1, Ordering::AcqRel);
                    record.success_micros.fetch_add(micros, Ordering::AcqRel);
                }
                result
            }
            Err(_) => {
                record.timeouts.fetch_add(1, Ordering::AcqRel);
                if let Some(sender) = &self.events {
                    let _ = sender.send(PolicyEvent::TimedOut { key: key.to_string() });
                }
                let elapsed = started.elapsed();
                tracing::warn!(key, ?elapsed, ?limit, "operation timed out");
                Err(PolicyError::Timeout { elapsed, limit })
            }
        }
    }

    /// Snapshot the counters for `key`, if it has been used.
    pub fn snapshot(&self, key: &str) -> Option<TimeoutSnapshot> {
        self.store.get(key).map(|record| Self::snapshot_record(&record))
    }

    /// Snapshot every key's counters, sorted by key.
    pub fn all_snapshots(&self) -> Vec<(String, TimeoutSnapshot)> {
        self.store
            .snapshot()
            .into_iter()
            .map(|(key, record)| (key, Self::snapshot_record(&record)))
            .collect()
    }

    fn snapshot_record(record: &TimeoutRecord) -> TimeoutSnapshot {
        let successes = record.successes.load(Ordering::Acquire);
        let average_success = if successes > 0 {
            let micros = record.success_micros.load(Ordering::Acquire);
            Some(Duration::from_micros(micros / successes))
        } else {
            None
        };
        TimeoutSnapshot {
            total: record.total.load(Ordering::Acquire),
            timeouts: record.timeouts.load(Ordering::Acquire),
            successes,
            average_success,
        }
    }
}

impl Default for TimeoutEnforcer {
    fn default() -> Self {
        Self {
            store: Arc::new(PolicyStore::new()),
            config: Arc::new(KeyedConfig::default()),
            events: None,
        }
    }
}
