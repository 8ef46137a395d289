//! Live-updatable shared values.
//!
//! Policies read their tunables on every admission decision, so reads must
//! stay lock-free. `ArcSwap` gives a wait-free load; writers pay the
//! allocation.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// `Tunable<T>` gives cheap reads and controlled updates for a shared value.
#[derive(Debug)]
pub struct Tunable<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for Tunable<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Tunable<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap `Arc` clone).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.inner.load_full();
        self.inner.store(Arc::new(f(&current)));
    }
}

impl<T: Default> Default for Tunable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
