//! The open-item table.
//!
//! At most one item object exists per [`ItemKey`]. The table is split into
//! shards, each behind its own mutex; an item is created, enrolled and evicted
//! only while its shard is locked, so a lookup never sees an object that is
//! about to be replaced.
//!
//! When another transaction holds an item, the opener drops the shard lock
//! and helps the holder finish by joining its commit fan-out, then retries.

use crate::coordinator::CoordinatorRepository;
use crate::error::{CoreError, CoreResult};
use crate::item::{ItemJournals, OpenItem};
use crate::lock::LockLevel;
use crate::types::{ItemKey, Xid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Number of independently locked partitions.
pub(crate) const SHARDS: usize = 283;

const POLL: Duration = Duration::from_millis(10);

pub(crate) struct OpenItemTable {
    shards: Vec<Mutex<HashMap<ItemKey, OpenItem>>>,
}

impl OpenItemTable {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &ItemKey) -> &Mutex<HashMap<ItemKey, OpenItem>> {
        &self.shards[key.id.shard(SHARDS)]
    }

    /// Returns the live object for `key` and enrolls `xid` on it.
    ///
    /// `load` builds the object when none is open.
    ///
    /// # Errors
    ///
    /// Returns whatever `load` returns, or `LockTimeout` if another
    /// transaction keeps the item past `timeout`.
    pub(crate) fn open(
        &self,
        key: &ItemKey,
        xid: &Xid,
        journals: &Arc<dyn ItemJournals>,
        coordinators: &CoordinatorRepository,
        timeout: Duration,
        load: impl Fn() -> CoreResult<OpenItem>,
    ) -> CoreResult<OpenItem> {
        let started = Instant::now();
        loop {
            let mut shard = self.shard(key).lock();
            let holder = match shard.get(key) {
                None => {
                    let item = load()?;
                    if !item.begin(xid, journals) {
                        return Err(CoreError::invalid_operation(format!(
                            "fresh item {key} refused enrollment"
                        )));
                    }
                    shard.insert(key.clone(), item.clone());
                    return Ok(item);
                }
                Some(item) => {
                    if item.begin(xid, journals) {
                        return Ok(item.clone());
                    }
                    let lock = item.as_item().item_lock();
                    (lock.transaction_lock_holder(), lock.queue_length())
                }
            };
            drop(shard);

            let (owner, queue_length) = holder;
            if started.elapsed() >= timeout {
                return Err(CoreError::lock_timeout(
                    key.to_string(),
                    LockLevel::Read,
                    xid,
                    owner.map(|o| o.to_string()),
                    queue_length,
                    started.elapsed(),
                ));
            }
            let helped = owner
                .and_then(|owner| coordinators.get(&owner))
                .is_some_and(|coordinator| coordinator.accelerate_commit(POLL));
            if helped {
                debug!(%key, %xid, "helped holder finish before opening");
            } else {
                thread::sleep(POLL);
            }
        }
    }

    /// Returns the open object for `key`, if any.
    pub(crate) fn get(&self, key: &ItemKey) -> Option<OpenItem> {
        self.shard(key).lock().get(key).cloned()
    }

    /// Drops the object for `key` if no transaction is enrolled on it.
    pub(crate) fn evict_if_unused(&self, key: &ItemKey) -> bool {
        let mut shard = self.shard(key).lock();
        let unused = shard
            .get(key)
            .is_some_and(|item| !item.as_item().has_transactions());
        if unused {
            shard.remove(key);
        }
        unused
    }

    /// Returns the number of open objects.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

impl fmt::Debug for OpenItemTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenItemTable")
            .field("shards", &self.shards.len())
            .field("open", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::testing::MemoryJournals;
    use crate::item::{RangeCaches, RangeItem};
    use crate::types::ItemKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::tempdir;
    use xfstore_storage::{AllocatorFactory, ItemId};

    #[test]
    fn concurrent_opens_share_one_object() {
        let dir = tempdir().unwrap();
        let factory = Arc::new(AllocatorFactory::new(dir.path()));
        let caches = Arc::new(RangeCaches::new(8, 8));
        let table = Arc::new(OpenItemTable::new());
        let repo = Arc::new(CoordinatorRepository::default());
        let loads = Arc::new(AtomicUsize::new(0));
        let key = ItemKey::new(ItemKind::Range, ItemId::parse("/ts/a").unwrap());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8u64)
            .map(|n| {
                let (table, repo, loads, key, barrier, factory, caches) = (
                    Arc::clone(&table),
                    Arc::clone(&repo),
                    Arc::clone(&loads),
                    key.clone(),
                    Arc::clone(&barrier),
                    Arc::clone(&factory),
                    Arc::clone(&caches),
                );
                thread::spawn(move || {
                    let journals: Arc<dyn ItemJournals> = MemoryJournals::shared();
                    barrier.wait();
                    table
                        .open(&key, &Xid::Local(n), &journals, &repo, Duration::from_secs(1), || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            let allocator = factory.find_allocator(&key.id, true)?.ok_or_else(|| {
                                CoreError::item_not_found(&key)
                            })?;
                            Ok(OpenItem::Range(Arc::new(RangeItem::new(
                                key.id.clone(),
                                allocator,
                                Arc::clone(&caches),
                                Duration::from_secs(1),
                            ))))
                        })
                        .unwrap()
                })
            })
            .collect();
        let items: Vec<OpenItem> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(items.iter().all(|item| item.same_object(&items[0])));
        assert_eq!(table.len(), 1);

        assert!(!table.evict_if_unused(&key));
        for n in 0..8 {
            items[0].as_item().rollback_transaction(&Xid::Local(n)).unwrap();
        }
        assert!(table.evict_if_unused(&key));
        assert!(table.get(&key).is_none());
    }

    #[test]
    fn held_item_times_out_for_others() {
        let dir = tempdir().unwrap();
        let factory = AllocatorFactory::new(dir.path());
        let caches = Arc::new(RangeCaches::new(8, 8));
        let table = OpenItemTable::new();
        let repo = CoordinatorRepository::default();
        let key = ItemKey::new(ItemKind::Range, ItemId::parse("/ts/a").unwrap());
        let load = || {
            let allocator = factory
                .find_allocator(&key.id, true)?
                .ok_or_else(|| CoreError::item_not_found(&key))?;
            Ok(OpenItem::Range(Arc::new(RangeItem::new(
                key.id.clone(),
                allocator,
                Arc::clone(&caches),
                Duration::from_millis(50),
            ))))
        };
        let journals: Arc<dyn ItemJournals> = MemoryJournals::shared();
        let (a, b) = (Xid::Local(1), Xid::Local(2));
        let item = table
            .open(&key, &a, &journals, &repo, Duration::from_millis(50), load)
            .unwrap();
        item.as_item()
            .acquire_transaction_lock(&a, Duration::from_millis(50))
            .unwrap();
        let err = table
            .open(&key, &b, &journals, &repo, Duration::from_millis(50), load)
            .unwrap_err();
        assert!(err.is_lock_timeout());
    }
}
