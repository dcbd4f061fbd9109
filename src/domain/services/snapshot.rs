//! Atomically swapped immutable snapshots for read-mostly shared state

use std::sync::{Arc, RwLock};

/// Holds an `Arc<T>` that readers clone and writers replace wholesale.
///
/// The lock is only held for the pointer copy, never across an await or a computation,
/// so readers always see either the old or the new snapshot in full.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn store(&self, value: T) {
        let value = Arc::new(value);
        match self.inner.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    /// Build the next snapshot from the current one and swap it in
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = f(&guard);
        *guard = Arc::new(next);
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
