//! Journal consumers: merge journaled writes into item storage.
//!
//! Commit and recovery both stream a transaction's journals through a
//! [`Router`](crate::router::Router) into a [`JournalMerger`]. Entries are
//! routed by item identifier, so every entry of one item is applied in journal
//! order by a single consumer thread.
//!
//! Metadata and point-tree entries replace a whole file, so only the last one
//! per item is kept and written by [`JournalMerger::complete`].

use crate::error::{CoreError, CoreResult};
use crate::item::{
    POINTS_DELETED, POINTS_TREE, POINTS_USER_DATA, RANGE_DELETE, RANGE_META, RANGE_OP,
};
use crate::journal::{JournalEntry, JournalIterator};
use crate::router::{Consumer, RoutingKey, WorkSource};
use crate::types::ItemKind;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use xfstore_storage::{AllocatorFactory, ItemId, ItemStorage, StorageAllocator};

/// One journal entry on its way to storage.
#[derive(Debug)]
pub(crate) struct JournalWork {
    pub(crate) kind: ItemKind,
    pub(crate) entry: JournalEntry,
}

impl RoutingKey for JournalWork {
    fn routing_key(&self) -> u64 {
        self.entry.id.stable_hash()
    }
}

/// Streams the range and point journals at the given paths, in that order.
pub(crate) fn journal_source(
    range: Option<&Path>,
    points: Option<&Path>,
) -> CoreResult<WorkSource<JournalWork>> {
    let mut sources: Vec<WorkSource<JournalWork>> = Vec::new();
    for (path, kind) in [(range, ItemKind::Range), (points, ItemKind::Points)] {
        if let Some(path) = path {
            let entries = JournalIterator::open(path)?
                .map(move |next| next.map(|(_, entry)| JournalWork { kind, entry }));
            sources.push(Box::new(entries));
        }
    }
    Ok(Box::new(sources.into_iter().flatten()))
}

/// How entries are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeMode {
    /// Live commit: items exist and finalize themselves afterwards.
    Commit,
    /// Startup replay: storage is recreated as needed and finalized here.
    Recovery,
}

type Touched = BTreeMap<(ItemKind, ItemId), Arc<dyn StorageAllocator>>;

/// Applies journal entries to item storage.
pub(crate) struct JournalMerger {
    mode: MergeMode,
    series: Arc<AllocatorFactory>,
    points: Arc<AllocatorFactory>,
    touched: Mutex<Touched>,
    deleted: Mutex<BTreeSet<(ItemKind, ItemId)>>,
    replaced: Mutex<BTreeMap<(ItemKind, ItemId), Vec<u8>>>,
}

impl JournalMerger {
    pub(crate) fn new(
        mode: MergeMode,
        series: Arc<AllocatorFactory>,
        points: Arc<AllocatorFactory>,
    ) -> Self {
        Self {
            mode,
            series,
            points,
            touched: Mutex::new(BTreeMap::new()),
            deleted: Mutex::new(BTreeSet::new()),
            replaced: Mutex::new(BTreeMap::new()),
        }
    }

    fn allocator(&self, kind: ItemKind, id: &ItemId) -> CoreResult<Option<Arc<dyn StorageAllocator>>> {
        let key = (kind, id.clone());
        if let Some(allocator) = self.touched.lock().get(&key) {
            return Ok(Some(Arc::clone(allocator)));
        }
        let factory = match kind {
            ItemKind::Points => &self.points,
            _ => &self.series,
        };
        let found = factory.find_allocator(id, self.mode == MergeMode::Recovery)?;
        if let Some(allocator) = &found {
            self.touched.lock().insert(key, Arc::clone(allocator));
        }
        Ok(found)
    }

    fn storage(&self, allocator: &dyn StorageAllocator, id: &ItemId) -> CoreResult<Arc<ItemStorage>> {
        Ok(match self.mode {
            MergeMode::Commit => allocator.storage(id)?,
            MergeMode::Recovery => allocator.create(id)?,
        })
    }

    fn delete(&self, kind: ItemKind, allocator: &dyn StorageAllocator, id: &ItemId) -> CoreResult<()> {
        self.replaced.lock().remove(&(kind, id.clone()));
        match self.mode {
            MergeMode::Commit => allocator.delete(id, false)?,
            MergeMode::Recovery => {
                allocator.delete(id, true)?;
                self.deleted.lock().insert((kind, id.clone()));
            }
        }
        Ok(())
    }

    fn apply(&self, work: JournalWork) -> CoreResult<()> {
        let JournalWork { kind, entry } = work;
        let Some(allocator) = self.allocator(kind, &entry.id)? else {
            return Ok(());
        };
        let allocator = allocator.as_ref();
        match (kind, entry.dest) {
            (ItemKind::Range, RANGE_OP) | (ItemKind::Points, POINTS_USER_DATA) => Ok(()),
            (ItemKind::Range, RANGE_DELETE) | (ItemKind::Points, POINTS_DELETED) => {
                self.delete(kind, allocator, &entry.id)
            }
            (ItemKind::Range, RANGE_META) | (ItemKind::Points, POINTS_TREE) => {
                self.revive(kind, &entry.id);
                self.replaced.lock().insert((kind, entry.id), entry.payload);
                Ok(())
            }
            (ItemKind::Range, offset) if offset >= 0 => {
                self.revive(kind, &entry.id);
                Ok(self
                    .storage(allocator, &entry.id)?
                    .write_data(offset.unsigned_abs(), &entry.payload)?)
            }
            (kind, dest) => Err(CoreError::journal_corruption(format!(
                "unknown {kind} journal destination {dest} for {}",
                entry.id
            ))),
        }
    }

    /// A write after a delete recreates the item.
    fn revive(&self, kind: ItemKind, id: &ItemId) {
        if self.mode == MergeMode::Recovery {
            self.deleted.lock().remove(&(kind, id.clone()));
        }
    }

    /// Returns the allocators of every item merged so far.
    pub(crate) fn allocators(&self) -> Vec<Arc<dyn StorageAllocator>> {
        let mut seen = BTreeSet::new();
        self.touched
            .lock()
            .values()
            .filter(|a| seen.insert(a.path().to_string()))
            .cloned()
            .collect()
    }

    /// Finishes the merge.
    ///
    /// Recovery marks every surviving item committed. Both modes sync the
    /// merged storage when `sync` is set, then write allocator indexes.
    pub(crate) fn complete(&self, sync: bool) -> CoreResult<()> {
        let replaced = std::mem::take(&mut *self.replaced.lock());
        for ((kind, id), payload) in replaced {
            let Some(allocator) = self.allocator(kind, &id)? else {
                continue;
            };
            let storage = self.storage(allocator.as_ref(), &id)?;
            match kind {
                ItemKind::Points => storage.replace_data(&payload)?,
                _ => storage.replace_meta(&payload)?,
            }
        }
        let touched: Vec<_> = self
            .touched
            .lock()
            .iter()
            .map(|(key, allocator)| (key.clone(), Arc::clone(allocator)))
            .collect();
        let deleted = self.deleted.lock().clone();
        for ((kind, id), allocator) in &touched {
            if deleted.contains(&(*kind, id.clone())) || !allocator.has_item(id)? {
                continue;
            }
            if self.mode == MergeMode::Recovery {
                allocator.mark_old(id)?;
            }
            if sync {
                allocator.storage(id)?.sync()?;
            }
        }
        for allocator in self.allocators() {
            allocator.commit_pending_modifications()?;
        }
        Ok(())
    }
}

impl Consumer<JournalWork> for JournalMerger {
    fn consume(&self, item: JournalWork) -> CoreResult<()> {
        self.apply(item)
    }
}

impl fmt::Debug for JournalMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalMerger")
            .field("mode", &self.mode)
            .field("touched", &self.touched.lock().len())
            .finish_non_exhaustive()
    }
}
