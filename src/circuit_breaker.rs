//! Keyed circuit breaker with lock-free atomics.
//!
//! Each policy key gets its own circuit; failures against one dependency
//! never trip another's circuit. State transitions use compare-exchange so
//! concurrent callers agree on a single winner, and the half-open probe slot
//! is released through a guard that survives panics in the probed operation.

use crate::clock::{Clock, MonotonicClock};
use crate::config::{CircuitBreakerConfig, ConfigError, KeyedConfig};
use crate::error::PolicyError;
use crate::events::{PolicyEvent, PolicyKind};
use crate::store::PolicyStore;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;
const STATE_ISOLATED: u8 = 3;

/// Current state of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the break duration elapses.
    Open,
    /// Allows a single probe call to test recovery.
    HalfOpen,
    /// Manually forced open; only an explicit reset or close reopens traffic.
    Isolated,
}

impl CircuitState {
    fn from_u8(v: u8) -> Option<CircuitState> {
        match v {
            STATE_CLOSED => Some(CircuitState::Closed),
            STATE_OPEN => Some(CircuitState::Open),
            STATE_HALF_OPEN => Some(CircuitState::HalfOpen),
            STATE_ISOLATED => Some(CircuitState::Isolated),
            _ => None,
        }
    }
}

/// A state change on one circuit, published on the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    /// Policy key of the circuit that changed state.
    pub key: String,
    pub previous: CircuitState,
    pub next: CircuitState,
}

/// Read-only view of one circuit, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    /// Consecutive failures observed since the last success or reset.
    pub consecutive_failures: usize,
    /// How long the circuit has been open or isolated; `None` when admitting.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct CircuitRecord {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    probe_in_flight: AtomicBool,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
        }
    }
}

// Releases the half-open probe slot even if the probed operation panics.
struct ProbeGuard<'a> {
    record: &'a CircuitRecord,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.record.probe_in_flight.store(false, Ordering::Release);
    }
}

/// Keyed circuit breaker guarding async operations.
///
/// Clones share the same underlying per-key state via `Arc`, so all handles
/// observe and affect the same circuit lifecycles.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    store: Arc<PolicyStore<CircuitRecord>>,
    config: Arc<KeyedConfig<CircuitBreakerConfig>>,
    clock: Arc<dyn Clock>,
    events: Option<UnboundedSender<PolicyEvent>>,
}

impl CircuitBreaker {
    /// Create a breaker from a per-key config surface, validating every entry.
    pub fn new(config: KeyedConfig<CircuitBreakerConfig>) -> Result<Self, ConfigError> {
        config.validate_with(CircuitBreakerConfig::validate)?;
        Ok(Self {
            store: Arc::new(PolicyStore::new()),
            config: Arc::new(config),
            clock: Arc::new(MonotonicClock::default()),
            events: None,
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Publish every state transition and rejection on `sender`. The send
    /// never blocks; a dropped receiver is ignored.
    pub fn with_events(mut self, sender: UnboundedSender<PolicyEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Execute `operation` under the circuit for `key`. Every inner failure
    /// counts against the circuit.
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
        self.execute_classified(key, operation, |_| true).await
    }

    /// Execute `operation` under the circuit for `key`, counting only inner
    /// failures for which `counts_as_failure` returns true.
    ///
    /// Rejections from other policy layers (timeouts in particular) always
    /// count: the dependency did not answer in time, which is exactly the
    /// signal the circuit exists to track.
    pub async fn execute_classified<T, E, Fut, Op, P>(
        &self,
        key: &str,
        operation: Op,
        counts_as_failure: P,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
        P: Fn(&E) -> bool + Send,
    {
        let config = self.config.resolve(key);
        let record = self.store.get_or_insert_with(key, CircuitRecord::new);

        let mut probe: Option<ProbeGuard<'_>> = None;

        loop {
            let current = match CircuitState::from_u8(record.state.load(Ordering::Acquire)) {
                Some(s) => s,
                // Unknown state byte: fail safe by rejecting.
                None => return Err(self.rejection(key, &record)),
            };

            match current {
                CircuitState::Closed => break,
                CircuitState::Isolated => return Err(self.rejection(key, &record)),
                CircuitState::Open => {
                    let opened_at = record.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    let break_millis = config.break_duration.as_millis().min(u64::MAX as u128) as u64;

                    if elapsed < break_millis {
                        return Err(self.rejection(key, &record));
                    }

                    // Break duration elapsed: race to become the probe.
                    match record.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.emit(key, CircuitState::Open, CircuitState::HalfOpen);
                            // Claim the probe slot atomically: a caller that
                            // observed HalfOpen may have taken it already, in
                            // which case it is the probe and we reject.
                            if record
                                .probe_in_flight
                                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                                .is_err()
                            {
                                return Err(self.rejection(key, &record));
                            }
                            probe = Some(ProbeGuard { record: &record });
                            tracing::info!(key, "circuit half-open, probing");
                            break;
                        }
                        Err(STATE_CLOSED) => break,
                        Err(STATE_ISOLATED) => return Err(self.rejection(key, &record)),
                        // Someone else won the probe race; re-check.
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    if record
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        probe = Some(ProbeGuard { record: &record });
                        tracing::debug!(key, "circuit half-open, probing");
                        break;
                    }
                    // A probe is already in flight; reject rather than pile on.
                    return Err(self.rejection(key, &record));
                }
            }
        }

        let result = operation().await;
        drop(probe);

        match &result {
            Ok(_) => self.on_success(key, &record),
            Err(PolicyError::Inner(e)) => {
                if counts_as_failure(e) {
                    self.on_failure(key, &record, config.failure_threshold);
                }
            }
            Err(_) => self.on_failure(key, &record, config.failure_threshold),
        }

        result
    }

    /// Force the circuit for `key` open until explicitly reset or closed.
    pub fn isolate(&self, key: &str) {
        let record = self.store.get_or_insert_with(key, CircuitRecord::new);
        let previous = record.state.swap(STATE_ISOLATED, Ordering::AcqRel);
        record.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
        if let Some(previous) = CircuitState::from_u8(previous) {
            if previous != CircuitState::Isolated {
                tracing::warn!(key, "circuit isolated");
                self.emit(key, previous, CircuitState::Isolated);
            }
        }
    }

    /// Return the circuit for `key` to Closed and clear its failure count.
    pub fn reset(&self, key: &str) {
        let record = self.store.get_or_insert_with(key, CircuitRecord::new);
        let previous = record.state.swap(STATE_CLOSED, Ordering::AcqRel);
        record.consecutive_failures.store(0, Ordering::Release);
        record.opened_at_millis.store(0, Ordering::Release);
        if let Some(previous) = CircuitState::from_u8(previous) {
            if previous != CircuitState::Closed {
                tracing::info!(key, "circuit reset to closed");
                self.emit(key, previous, CircuitState::Closed);
            }
        }
    }

    /// Return the circuit for `key` to Closed, keeping its failure count.
    /// One more counted failure can re-trip the circuit immediately.
    pub fn close(&self, key: &str) {
        let record = self.store.get_or_insert_with(key, CircuitRecord::new);
        let previous = record.state.swap(STATE_CLOSED, Ordering::AcqRel);
        record.opened_at_millis.store(0, Ordering::Release);
        if let Some(previous) = CircuitState::from_u8(previous) {
            if previous != CircuitState::Closed {
                tracing::info!(key, "circuit closed");
                self.emit(key, previous, CircuitState::Closed);
            }
        }
    }

    /// Snapshot the circuit for `key`, if it has been used.
    pub fn state(&self, key: &str) -> Option<CircuitSnapshot> {
        self.store.get(key).map(|record| self.snapshot_record(&record))
    }

    /// Snapshot every circuit, sorted by key.
    pub fn all_states(&self) -> Vec<(String, CircuitSnapshot)> {
        self.store
            .snapshot()
            .into_iter()
            .map(|(key, record)| {
                let snapshot = self.snapshot_record(&record);
                (key, snapshot)
            })
            .collect()
    }

    fn snapshot_record(&self, record: &CircuitRecord) -> CircuitSnapshot {
        let state = CircuitState::from_u8(record.state.load(Ordering::Acquire))
            .unwrap_or(CircuitState::Open);
        let open_for = match state {
            CircuitState::Open | CircuitState::Isolated | CircuitState::HalfOpen => {
                let opened_at = record.opened_at_millis.load(Ordering::Acquire);
                Some(Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at)))
            }
            CircuitState::Closed => None,
        };
        CircuitSnapshot {
            state,
            consecutive_failures: record.consecutive_failures.load(Ordering::Acquire),
            open_for,
        }
    }

    fn on_success(&self, key: &str, record: &CircuitRecord) {
        let current = CircuitState::from_u8(record.state.load(Ordering::Acquire));
        match current {
            Some(CircuitState::HalfOpen) => {
                if record
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    record.consecutive_failures.store(0, Ordering::Release);
                    record.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(key, "circuit closed after successful probe");
                    self.emit(key, CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            Some(CircuitState::Closed) => {
                record.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self, key: &str, record: &CircuitRecord, threshold: usize) {
        let current = CircuitState::from_u8(record.state.load(Ordering::Acquire));
        let failures = record.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            Some(CircuitState::HalfOpen) => {
                if record
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    record.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(key, failures, "probe failed, circuit reopened");
                    self.emit(key, CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            Some(CircuitState::Closed) => {
                if failures >= threshold
                    && record
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    record.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(key, failures, threshold, "circuit opened");
                    self.emit(key, CircuitState::Closed, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn rejection<E>(&self, key: &str, record: &CircuitRecord) -> PolicyError<E> {
        self.send(PolicyEvent::Rejected {
            policy: PolicyKind::CircuitBreaker,
            key: key.to_string(),
        });
        let opened_at = record.opened_at_millis.load(Ordering::Acquire);
        PolicyError::ShortCircuited {
            key: key.to_string(),
            consecutive_failures: record.consecutive_failures.load(Ordering::Acquire),
            open_for: Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at)),
        }
    }

    fn emit(&self, key: &str, previous: CircuitState, next: CircuitState) {
        self.send(PolicyEvent::CircuitTransition(CircuitTransition {
            key: key.to_string(),
            previous,
            next,
        }));
    }

    fn send(&self, event: PolicyEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            store: Arc::new(PolicyStore::new()),
            config: Arc::new(KeyedConfig::default()),
            clock: Arc::new(MonotonicClock::default()),
            events: None,
        }
    }
}
