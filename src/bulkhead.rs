//! Keyed bulkhead for concurrency isolation.
//!
//! Each key gets its own pool of permits plus a bounded wait queue. A caller
//! that finds every slot busy may wait for a permit for up to the configured
//! queue timeout; if the queue itself is full, the call is rejected
//! immediately. Queued callers acquire permits in FIFO order (tokio's
//! semaphore is fair). A saturated pool for one key never starves another
//! key's pool.

use crate::config::{BulkheadConfig, ConfigError, KeyedConfig};
use crate::error::PolicyError;
use crate::events::{PolicyEvent, PolicyKind};
use crate::store::PolicyStore;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Read-only view of one bulkhead pool, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadSnapshot {
    /// Calls currently holding a permit.
    pub active: usize,
    pub max_concurrency: usize,
    /// Callers currently waiting for a permit.
    pub queued: usize,
    pub queue_capacity: usize,
    /// Calls admitted since the pool was created.
    pub admitted: u64,
    /// Calls rejected since the pool was created.
    pub rejected: u64,
}

impl BulkheadSnapshot {
    /// Fraction of permits in use, in `[0, 1]`.
    pub fn saturation(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 0.0;
        }
        self.active as f64 / self.max_concurrency as f64
    }
}

#[derive(Debug)]
struct BulkheadRecord {
    semaphore: Semaphore,
    max_concurrency: usize,
    queue_capacity: usize,
    queue_timeout: Duration,
    queued: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl BulkheadRecord {
    fn new(config: &BulkheadConfig) -> Self {
        Self {
            semaphore: Semaphore::new(config.max_concurrency),
            max_concurrency: config.max_concurrency,
            queue_capacity: config.queue_capacity,
            queue_timeout: config.queue_timeout,
            queued: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn active(&self) -> usize {
        self.max_concurrency.saturating_sub(self.semaphore.available_permits())
    }

    /// Claim a queue slot if one is free.
    fn try_enqueue(&self) -> bool {
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                if queued < self.queue_capacity {
                    Some(queued + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

// Releases a claimed queue slot even if the waiting future is dropped.
struct QueueGuard<'a> {
    record: &'a BulkheadRecord,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.record.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keyed bulkhead guarding async operations.
///
/// Clones share the same per-key pools via `Arc`.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    store: Arc<PolicyStore<BulkheadRecord>>,
    config: Arc<KeyedConfig<BulkheadConfig>>,
    events: Option<UnboundedSender<PolicyEvent>>,
}

impl Bulkhead {
    /// Create a bulkhead from a per-key config surface, validating every entry.
    pub fn new(config: KeyedConfig<BulkheadConfig>) -> Result<Self, ConfigError> {
        config.validate_with(BulkheadConfig::validate)?;
        Ok(Self { store: Arc::new(PolicyStore::new()), config: Arc::new(config), events: None })
    }

    /// Publish every admission and rejection on `sender`. The send never
    /// blocks; a dropped receiver is ignored.
    pub fn with_events(mut self, sender: UnboundedSender<PolicyEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Execute `operation` in the pool for `key`.
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
        self.run(key, operation, None).await
    }

    /// Execute `operation` in the pool for `key`, abandoning a queued wait
    /// when `cancel` fires. Cancellation while queued counts as a rejection.
    pub async fn execute_cancellable<T, E, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
        cancel: &CancellationToken,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.run(key, operation, Some(cancel)).await
    }

    /// Snapshot the pool for `key`, if it has been used.
    pub fn snapshot(&self, key: &str) -> Option<BulkheadSnapshot> {
        self.store.get(key).map(|record| Self::snapshot_record(&record))
    }

    /// Snapshot every pool, sorted by key.
    pub fn all_snapshots(&self) -> Vec<(String, BulkheadSnapshot)> {
        self.store
            .snapshot()
            .into_iter()
            .map(|(key, record)| (key, Self::snapshot_record(&record)))
            .collect()
    }

    fn snapshot_record(record: &BulkheadRecord) -> BulkheadSnapshot {
        BulkheadSnapshot {
            active: record.active(),
            max_concurrency: record.max_concurrency,
            queued: record.queued.load(Ordering::Acquire),
            queue_capacity: record.queue_capacity,
            admitted: record.admitted.load(Ordering::Acquire),
            rejected: record.rejected.load(Ordering::Acquire),
        }
    }

    async fn run<T, E, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let config = self.config.resolve(key);
        let record = self.store.get_or_insert_with(key, || BulkheadRecord::new(config));

        let permit = match record.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                if !record.try_enqueue() {
                    tracing::warn!(key, "bulkhead rejected call, queue full");
                    return Err(self.reject(key, &record));
                }
                let _queue_slot = QueueGuard { record: &record };

                let cancelled = async {
                    match cancel {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    acquired = record.semaphore.acquire() => {
                        match acquired {
                            Ok(permit) => permit,
                            // Semaphore is never closed; treat it as rejection
                            // rather than panicking.
                            Err(_) => return Err(self.reject(key, &record)),
                        }
                    }
                    _ = tokio::time::sleep(record.queue_timeout) => {
                        tracing::warn!(key, timeout = ?record.queue_timeout, "bulkhead queue wait timed out");
                        return Err(self.reject(key, &record));
                    }
                    _ = cancelled => {
                        tracing::debug!(key, "bulkhead queue wait cancelled");
                        return Err(self.reject(key, &record));
                    }
                }
            }
        };

        record.admitted.fetch_add(1, Ordering::AcqRel);
        if let Some(sender) = &self.events {
            let _ = sender
                .send(PolicyEvent::Admitted { policy: PolicyKind::Bulkhead, key: key.to_string() });
        }
        let result = operation().await;
        drop(permit);
        result
    }

    /// Count and publish a rejection, then build the caller-facing error.
    fn reject<E>(&self, key: &str, record: &BulkheadRecord) -> PolicyError<E> {
        record.rejected.fetch_add(1, Ordering::AcqRel);
        if let Some(sender) = &self.events {
            let _ = sender
                .send(PolicyEvent::Rejected { policy: PolicyKind::Bulkhead, key: key.to_string() });
        }
        PolicyError::BulkheadRejected {
            key: key.to_string(),
            active: record.active(),
            max_concurrency: record.max_concurrency,
            queued: record.queued.load(Ordering::Acquire),
            queue_capacity: record.queue_capacity,
        }
    }
}

impl Default for Bulkhead {
    fn default() -> Self {
        Self {
            store: Arc::new(PolicyStore::new()),
            config: Arc::new(KeyedConfig::default()),
            events: None,
        }
    }
}
