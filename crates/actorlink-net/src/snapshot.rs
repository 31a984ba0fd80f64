//! Copy-on-write snapshot cell
//!
//! Readers clone an `Arc` to the current value and never observe a
//! half-applied update. Writers build a new value and swap the pointer.
//! Neither side takes a lock.

use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug)]
pub struct SnapshotCell<T> {
    current: ArcSwap<T>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(value),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Replace the snapshot
    pub fn store(&self, value: T) {
        self.current.store(Arc::new(value));
    }
}

impl<T: Clone> SnapshotCell<T> {
    /// Derive the next snapshot from the current one.
    ///
    /// Only one task may update a given cell; concurrent updaters could lose
    /// each other's writes.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        let mut next = T::clone(&self.load());
        f(&mut next);
        self.store(next);
    }
}
