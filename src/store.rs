//! Per-key policy state store.
//!
//! One `PolicyStore` instance backs each policy kind. Records are created
//! lazily on first use and never removed; key cardinality is bounded by the
//! set of dependencies the application talks to. Reads take the lock only
//! long enough to clone an `Arc`, so monitor snapshots never hold writers
//! for unbounded time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe map of policy key to shared record.
#[derive(Debug)]
pub struct PolicyStore<R> {
    records: RwLock<HashMap<String, Arc<R>>>,
}

impl<R> Default for PolicyStore<R> {
    fn default() -> Self {
        Self { records: RwLock::new(HashMap::new()) }
    }
}

impl<R> PolicyStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the record for `key`, if one exists.
    pub fn get(&self, key: &str) -> Option<Arc<R>> {
        let guard = self.records.read().expect("policy store lock poisoned");
        guard.get(key).cloned()
    }

    /// Fetch the record for `key`, creating it with `init` on first use.
    ///
    /// The fast path is a read lock; the write lock is taken only when the
    /// key is new. `init` may run and be discarded if another caller races
    /// the same insertion.
    pub fn get_or_insert_with(&self, key: &str, init: impl FnOnce() -> R) -> Arc<R> {
        if let Some(record) = self.get(key) {
            return record;
        }
        let mut guard = self.records.write().expect("policy store lock poisoned");
        guard.entry(key.to_string()).or_insert_with(|| Arc::new(init())).clone()
    }

    /// Snapshot every record, sorted by key for stable reporting.
    pub fn snapshot(&self) -> Vec<(String, Arc<R>)> {
        let guard = self.records.read().expect("policy store lock poisoned");
        let mut entries: Vec<(String, Arc<R>)> =
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(guard);
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.records.read().expect("policy store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
