//! Bounded caches shared by all range items of an engine.
//!
//! The caches are advisory: a miss always falls back to storage or the
//! journal, so eviction never affects correctness.

use crate::item::range::{RangeMeta, RangeOp};
use crate::types::Xid;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use xfstore_storage::ItemId;

/// A thread-safe LRU cache with hit and miss counters.
pub struct SharedCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> SharedCache<K, V> {
    /// Creates a cache holding at most `capacity` entries (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a clone of the cached value and counts the lookup.
    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.entries.lock().get(key).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Inserts or replaces a value.
    pub fn put(&self, key: K, value: V) {
        self.entries.lock().put(key, value);
    }

    /// Removes a value.
    pub fn evict(&self, key: &K) {
        self.entries.lock().pop(key);
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `(hits, misses)` since creation.
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl<K: Hash + Eq, V> fmt::Debug for SharedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("len", &self.entries.lock().len())
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

/// Committed metadata and decoded pending operations of range items.
#[derive(Debug)]
pub struct RangeCaches {
    pub(crate) metadata: SharedCache<ItemId, Arc<RangeMeta>>,
    pub(crate) operations: SharedCache<(Xid, u64), RangeOp>,
}

impl RangeCaches {
    /// Creates both caches with the given capacities.
    #[must_use]
    pub fn new(metadata_capacity: usize, operation_capacity: usize) -> Self {
        Self {
            metadata: SharedCache::new(metadata_capacity),
            operations: SharedCache::new(operation_capacity),
        }
    }

    /// Returns metadata cache `(hits, misses)`.
    #[must_use]
    pub fn metadata_counters(&self) -> (u64, u64) {
        self.metadata.counters()
    }
}
