//! Copy-on-write observer collection
//!
//! Readers load the current snapshot without locking and may iterate it while
//! writers install replacements. Writers serialize on a mutex and never touch
//! a published snapshot.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Snapshot of the observers present at load time
pub type Snapshot<T> = Arc<Vec<Arc<T>>>;

/// Concurrent set of observers with lock-free reads
pub struct ObserverSet<T> {
    items: ArcSwap<Vec<Arc<T>>>,
    write_lock: Mutex<()>,
}

impl<T> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObserverSet<T> {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            items: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Append an observer, keeping insertion order.
    pub fn add(&self, item: Arc<T>) {
        let _guard = self.write_lock.lock();
        let current = self.items.load();

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(item);

        self.items.store(Arc::new(next));
    }

    /// Remove an observer by identity.
    ///
    /// Returns `false` and leaves the snapshot untouched when `item` is absent.
    pub fn remove(&self, item: &Arc<T>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.items.load();

        let Some(index) = current.iter().position(|x| Arc::ptr_eq(x, item)) else {
            return false;
        };

        let mut next = Vec::with_capacity(current.len() - 1);
        next.extend(current[..index].iter().cloned());
        next.extend(current[index + 1..].iter().cloned());

        self.items.store(Arc::new(next));
        true
    }

    /// Current snapshot
    pub fn items(&self) -> Snapshot<T> {
        self.items.load_full()
    }

    /// Number of observers in the current snapshot
    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    /// Whether the current snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }
}
