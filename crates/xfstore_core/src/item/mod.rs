//! Transactional item objects.
//!
//! One item object exists per open identifier. It owns the item's
//! [`ItemLock`] and the pending state of every transaction enrolled on it.
//! The three variants share one lifecycle:
//!
//! - **enroll**: a read lock is taken briefly to register the transaction
//! - **write**: the transaction lock is taken (and kept) before any change is
//!   journaled
//! - **prepare**: dirty state is made durable under the write lock
//! - **commit / rollback**: the state is finalized or discarded and every
//!   transaction lock hold is released
//!
//! A transaction that never dirtied an item leaves it without waiting on the
//! item lock.

mod blob;
mod cache;
mod intervals;
mod points;
mod range;

pub use blob::{BlobContent, BlobItem};
pub use cache::{RangeCaches, SharedCache};
pub use intervals::{IntervalSet, TaggedIntervalSet};
pub use points::{Mjd, Point, PointItem};
pub use range::{RangeItem, RangeMeta, RangeRead};

pub(crate) use blob::{ensure_sentinel, read_committed_blob, recover_blob};
pub(crate) use points::{
    read_committed_points, PointBatch, PointTree, POINTS_DELETED, POINTS_TREE, POINTS_USER_DATA,
};
pub(crate) use range::{read_committed, RangeOp, RANGE_DELETE, RANGE_META, RANGE_OP};

use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::lock::{ItemLock, ReadGuard};
use crate::types::{ItemKey, ItemKind, Xid};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xfstore_storage::{ItemId, StorageAllocator};

/// The contract every item variant implements.
pub trait TransactionalItem: Send + Sync {
    /// Returns the item's kind and identifier.
    fn key(&self) -> &ItemKey;

    /// Returns the item's lock.
    fn item_lock(&self) -> &ItemLock;

    /// Returns true while any transaction is enrolled.
    fn has_transactions(&self) -> bool;

    /// Returns true if `xid` is enrolled.
    fn knows_transaction(&self, xid: &Xid) -> bool;

    /// Returns true if `xid` changed the item.
    fn is_dirty(&self, xid: &Xid) -> bool;

    /// Returns true if the item is deleted in `xid`'s view.
    fn is_deleted(&self, xid: &Xid) -> bool;

    /// Deletes the item in `xid`'s view.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` or a journal error.
    fn delete(&self, xid: &Xid) -> CoreResult<()>;

    /// Makes `xid`'s pending changes durable ahead of commit.
    ///
    /// # Errors
    ///
    /// Returns `NotEnrolled`, `LockTimeout` or a journal error.
    fn prepare_transaction(&self, xid: &Xid) -> CoreResult<()>;

    /// Finalizes `xid` after its journal has been merged into storage.
    ///
    /// # Errors
    ///
    /// Returns `NotEnrolled`, `LockTimeout` or a storage error.
    fn commit_transaction(&self, xid: &Xid) -> CoreResult<()>;

    /// Discards `xid`'s pending changes. Unknown transactions are ignored.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` or a storage error.
    fn rollback_transaction(&self, xid: &Xid) -> CoreResult<()>;

    /// Drops a clean enrollment. Returns false if `xid` dirtied the item.
    ///
    /// # Errors
    ///
    /// Returns `NotEnrolled` if `xid` is not enrolled.
    fn done_with(&self, xid: &Xid) -> CoreResult<bool>;

    /// Returns the allocator and id if `xid` created the item's storage.
    fn created_in(&self, xid: &Xid) -> Option<(Arc<dyn StorageAllocator>, ItemId)>;

    /// Takes the transaction lock for `xid`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if another transaction keeps it past `timeout`.
    fn acquire_transaction_lock(&self, xid: &Xid, timeout: Duration) -> CoreResult<()> {
        self.item_lock().acquire_transaction_lock(xid, timeout)
    }

    /// Releases every hold `xid` has on the transaction lock.
    fn release_transaction_lock(&self, xid: &Xid) {
        self.item_lock().release_all_transaction_holds(xid);
    }
}

/// Journals and log records a transaction's items write to.
///
/// Implemented by the recovery log of each transaction; journal files are
/// created on first use so read-only transactions leave nothing behind.
pub trait ItemJournals: Send + Sync {
    /// Returns the range-item journal.
    ///
    /// # Errors
    ///
    /// Returns `EnrollmentClosed` once the transaction is committing, or an
    /// I/O error.
    fn range_journal(&self) -> CoreResult<Arc<Journal>>;

    /// Returns the point-item journal.
    ///
    /// # Errors
    ///
    /// Same as [`ItemJournals::range_journal`].
    fn points_journal(&self) -> CoreResult<Arc<Journal>>;

    /// Durably records that a blob is modified by the transaction.
    ///
    /// # Errors
    ///
    /// Same as [`ItemJournals::range_journal`].
    fn record_modified_blob(&self, id: &ItemId) -> CoreResult<()>;
}

/// Flags shared by every variant's per-transaction state.
#[derive(Debug, Default)]
pub(crate) struct StateFlags {
    dirty: AtomicBool,
    deleted: AtomicBool,
    created: AtomicBool,
}

impl StateFlags {
    pub(crate) fn dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_created(&self) {
        self.created.store(true, Ordering::SeqCst);
        self.deleted.store(false, Ordering::SeqCst);
        self.mark_dirty();
    }
}

/// Per-transaction state of one variant.
pub(crate) trait TxState: Send + Sync {
    fn flags(&self) -> &StateFlags;
}

/// Lock and enrollment bookkeeping shared by the variants.
pub(crate) struct ItemCore<S> {
    key: ItemKey,
    lock: ItemLock,
    timeout: Duration,
    transactions: Mutex<BTreeMap<Xid, Arc<S>>>,
}

impl<S: TxState> ItemCore<S> {
    pub(crate) fn new(key: ItemKey, timeout: Duration) -> Self {
        let lock = ItemLock::new(key.to_string());
        Self {
            key,
            lock,
            timeout,
            transactions: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn key(&self) -> &ItemKey {
        &self.key
    }

    pub(crate) fn lock(&self) -> &ItemLock {
        &self.lock
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Enrolls `xid` without blocking. Returns false if another transaction
    /// holds the transaction lock.
    pub(crate) fn begin(&self, xid: &Xid, make: impl FnOnce() -> S) -> bool {
        let Some(_guard) = self.lock.try_read(xid) else {
            return false;
        };
        self.transactions
            .lock()
            .entry(xid.clone())
            .or_insert_with(|| Arc::new(make()));
        true
    }

    pub(crate) fn state(&self, xid: &Xid) -> CoreResult<Arc<S>> {
        self.transactions
            .lock()
            .get(xid)
            .cloned()
            .ok_or_else(|| CoreError::not_enrolled(&self.key, xid))
    }

    /// Returns the state of a transaction that still sees the item.
    pub(crate) fn live_state(&self, xid: &Xid) -> CoreResult<Arc<S>> {
        let state = self.state(xid)?;
        if state.flags().deleted() {
            return Err(CoreError::item_not_found(&self.key));
        }
        Ok(state)
    }

    pub(crate) fn read_guard(&self, xid: &Xid) -> CoreResult<ReadGuard<'_>> {
        self.lock.read(xid, self.timeout)
    }

    /// Makes sure `xid` holds the transaction lock.
    pub(crate) fn hold(&self, xid: &Xid) -> CoreResult<()> {
        if self.lock.transaction_lock_holder().as_ref() == Some(xid) {
            return Ok(());
        }
        self.lock.acquire_transaction_lock(xid, self.timeout)
    }

    pub(crate) fn has_transactions(&self) -> bool {
        !self.transactions.lock().is_empty()
    }

    pub(crate) fn knows(&self, xid: &Xid) -> bool {
        self.transactions.lock().contains_key(xid)
    }

    pub(crate) fn flag(&self, xid: &Xid, read: impl Fn(&StateFlags) -> bool) -> bool {
        self.transactions
            .lock()
            .get(xid)
            .is_some_and(|state| read(state.flags()))
    }

    pub(crate) fn prepare(&self, xid: &Xid, work: impl FnOnce(&S) -> CoreResult<()>) -> CoreResult<()> {
        let state = self.state(xid)?;
        if !state.flags().dirty() {
            return Ok(());
        }
        // The write lock covers only the prepare work. Between prepare and
        // commit or rollback the transaction lock taken at the first write
        // keeps other writers out, and readers see committed state.
        let _guard = self.lock.write(xid, self.timeout)?;
        work(&state)
    }

    /// Removes `xid` and, if it was dirty, runs `work` with the states of the
    /// transactions still enrolled.
    pub(crate) fn commit(
        &self,
        xid: &Xid,
        work: impl FnOnce(&S, &BTreeMap<Xid, Arc<S>>) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let state = self.state(xid)?;
        let result = if state.flags().dirty() {
            let _guard = self.lock.write(xid, self.timeout)?;
            let mut transactions = self.transactions.lock();
            transactions.remove(xid);
            work(&state, &transactions)
        } else {
            self.transactions.lock().remove(xid);
            Ok(())
        };
        self.lock.release_all_transaction_holds(xid);
        result
    }

    pub(crate) fn rollback(&self, xid: &Xid, work: impl FnOnce(&S) -> CoreResult<()>) -> CoreResult<()> {
        let Ok(state) = self.state(xid) else {
            self.lock.release_all_transaction_holds(xid);
            return Ok(());
        };
        let result = if state.flags().dirty() {
            self.lock.write(xid, self.timeout).and_then(|_guard| {
                self.transactions.lock().remove(xid);
                work(&state)
            })
        } else {
            Ok(())
        };
        // Forgotten and released even when the work failed.
        self.transactions.lock().remove(xid);
        self.lock.release_all_transaction_holds(xid);
        result
    }

    pub(crate) fn done_with(&self, xid: &Xid) -> CoreResult<bool> {
        let mut transactions = self.transactions.lock();
        let state = transactions
            .get(xid)
            .ok_or_else(|| CoreError::not_enrolled(&self.key, xid))?;
        if state.flags().dirty() {
            return Ok(false);
        }
        transactions.remove(xid);
        drop(transactions);
        self.lock.release_all_transaction_holds(xid);
        Ok(true)
    }

    /// Marks every other clean enrollment deleted.
    pub(crate) fn propagate_delete(others: &BTreeMap<Xid, Arc<S>>) {
        for state in others.values() {
            if !state.flags().dirty() {
                state.flags().mark_deleted();
            }
        }
    }
}

impl<S> fmt::Debug for ItemCore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemCore")
            .field("key", &self.key)
            .field("transactions", &self.transactions.lock().len())
            .finish_non_exhaustive()
    }
}

/// An open item of any variant.
#[derive(Debug, Clone)]
pub enum OpenItem {
    /// A range-addressable series.
    Range(Arc<RangeItem>),
    /// A sparse point series.
    Points(Arc<PointItem>),
    /// A whole-item blob.
    Blob(Arc<BlobItem>),
}

impl OpenItem {
    /// Returns the item's kind.
    #[must_use]
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::Range(_) => ItemKind::Range,
            Self::Points(_) => ItemKind::Points,
            Self::Blob(_) => ItemKind::Blob,
        }
    }

    /// Returns the item through its shared contract.
    #[must_use]
    pub fn as_item(&self) -> &dyn TransactionalItem {
        match self {
            Self::Range(item) => item.as_ref(),
            Self::Points(item) => item.as_ref(),
            Self::Blob(item) => item.as_ref(),
        }
    }

    /// Returns a shared handle to the item's contract.
    #[must_use]
    pub fn to_shared(&self) -> Arc<dyn TransactionalItem> {
        match self {
            Self::Range(item) => Arc::clone(item) as Arc<dyn TransactionalItem>,
            Self::Points(item) => Arc::clone(item) as Arc<dyn TransactionalItem>,
            Self::Blob(item) => Arc::clone(item) as Arc<dyn TransactionalItem>,
        }
    }

    /// Returns true if both handles refer to the same object.
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Range(a), Self::Range(b)) => Arc::ptr_eq(a, b),
            (Self::Points(a), Self::Points(b)) => Arc::ptr_eq(a, b),
            (Self::Blob(a), Self::Blob(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Enrolls `xid` without blocking.
    pub(crate) fn begin(&self, xid: &Xid, journals: &Arc<dyn ItemJournals>) -> bool {
        match self {
            Self::Range(item) => item.begin(xid, journals),
            Self::Points(item) => item.begin(xid, journals),
            Self::Blob(item) => item.begin(xid, journals),
        }
    }

    /// Returns true if the item exists in `xid`'s view.
    pub(crate) fn exists_for(&self, xid: &Xid) -> CoreResult<bool> {
        match self {
            Self::Range(item) => item.exists_for(xid),
            Self::Points(item) => item.exists_for(xid),
            Self::Blob(item) => item.exists_for(xid),
        }
    }

    /// Creates the item's storage on behalf of `xid`.
    pub(crate) fn create_for(&self, xid: &Xid) -> CoreResult<()> {
        match self {
            Self::Range(item) => item.create_for(xid),
            Self::Points(item) => item.create_for(xid),
            Self::Blob(item) => item.create_for(xid),
        }
    }
}

/// Returns true if the allocator holds committed storage for `id`.
pub(crate) fn committed_in(allocator: &dyn StorageAllocator, id: &ItemId) -> CoreResult<bool> {
    Ok(allocator.has_item(id)? && !allocator.is_new(id)?)
}

/// Little-endian cursor over an encoded payload.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            return Err(CoreError::storage_corruption(format!(
                "{} truncated at byte {}",
                self.what, self.pos
            )));
        };
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    pub(crate) fn i64(&mut self) -> CoreResult<i64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(bytes))
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub(crate) fn f64(&mut self) -> CoreResult<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    pub(crate) fn f32(&mut self) -> CoreResult<f32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(f32::from_le_bytes(bytes))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub(crate) fn finish(&self) -> CoreResult<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(CoreError::storage_corruption(format!(
                "{} has {} trailing bytes",
                self.what,
                self.buf.len() - self.pos
            )))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Plain {
        flags: StateFlags,
    }

    impl TxState for Plain {
        fn flags(&self) -> &StateFlags {
            &self.flags
        }
    }

    fn core() -> ItemCore<Plain> {
        let key = ItemKey::new(ItemKind::Range, ItemId::parse("/ts/a").unwrap());
        ItemCore::new(key, Duration::from_millis(100))
    }

    #[test]
    fn begin_is_blocked_by_foreign_holder() {
        let core = core();
        let (a, b) = (Xid::Local(1), Xid::Local(2));
        assert!(core.begin(&a, Plain::default));
        core.hold(&a).unwrap();
        assert!(!core.begin(&b, Plain::default));
        assert!(core.begin(&a, Plain::default));
        core.rollback(&a, |_| Ok(())).unwrap();
        assert!(core.begin(&b, Plain::default));
    }

    #[test]
    fn hold_does_not_stack_for_owner() {
        let core = core();
        let a = Xid::Local(1);
        core.begin(&a, Plain::default);
        core.hold(&a).unwrap();
        core.hold(&a).unwrap();
        assert!(core.lock().release_transaction_lock(&a));
    }

    #[test]
    fn clean_commit_skips_work() {
        let core = core();
        let a = Xid::Local(1);
        core.begin(&a, Plain::default);
        core.commit(&a, |_, _| panic!("clean commit ran work")).unwrap();
        assert!(!core.has_transactions());
    }

    #[test]
    fn dirty_commit_sees_other_enrollments() {
        let core = core();
        let (a, b) = (Xid::Local(1), Xid::Local(2));
        core.begin(&a, Plain::default);
        core.begin(&b, Plain::default);
        core.state(&a).unwrap().flags().mark_dirty();
        core.state(&a).unwrap().flags().mark_deleted();
        core.commit(&a, |_, others| {
            assert_eq!(others.len(), 1);
            ItemCore::propagate_delete(others);
            Ok(())
        })
        .unwrap();
        assert!(core.flag(&b, StateFlags::deleted));
        assert!(matches!(
            core.live_state(&b),
            Err(CoreError::ItemNotFound { .. })
        ));
    }

    #[test]
    fn rollback_is_idempotent() {
        let core = core();
        let a = Xid::Local(1);
        core.begin(&a, Plain::default);
        core.hold(&a).unwrap();
        core.state(&a).unwrap().flags().mark_dirty();
        let mut runs = 0;
        core.rollback(&a, |_| {
            runs += 1;
            Ok(())
        })
        .unwrap();
        core.rollback(&a, |_| panic!("second rollback ran work")).unwrap();
        assert_eq!(runs, 1);
        assert_eq!(core.lock().transaction_lock_holder(), None);
    }

    #[test]
    fn failed_rollback_still_releases_the_item() {
        let core = core();
        let (a, b) = (Xid::Local(1), Xid::Local(2));
        core.begin(&a, Plain::default);
        core.hold(&a).unwrap();
        core.state(&a).unwrap().flags().mark_dirty();
        {
            let _reader = core.lock().read(&a, Duration::from_millis(10)).unwrap();
            let result = core.rollback(&a, |_| panic!("rollback ran work without the write lock"));
            assert!(matches!(result, Err(CoreError::LockTimeout { .. })));
        }
        assert!(!core.knows(&a));
        assert_eq!(core.lock().transaction_lock_holder(), None);
        assert!(core.begin(&b, Plain::default));
        core.hold(&b).unwrap();

        let result = core.rollback(&b, |_| Err(CoreError::interrupted("disk gone")));
        assert!(result.is_ok());
        core.begin(&a, Plain::default);
        core.hold(&a).unwrap();
        core.state(&a).unwrap().flags().mark_dirty();
        let result = core.rollback(&a, |_| Err(CoreError::interrupted("disk gone")));
        assert!(matches!(result, Err(CoreError::Interrupted { .. })));
        assert_eq!(core.lock().transaction_lock_holder(), None);
    }

    #[test]
    fn done_with_keeps_dirty_enrollment() {
        let core = core();
        let a = Xid::Local(1);
        core.begin(&a, Plain::default);
        core.state(&a).unwrap().flags().mark_dirty();
        assert!(!core.done_with(&a).unwrap());
        assert!(core.knows(&a));
        assert!(core.done_with(&Xid::Local(9)).is_err());
    }
}
