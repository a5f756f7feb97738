//! The transaction manager.
//!
//! [`TransactionManager`] is the engine's entry point. It owns the data
//! directory, runs startup recovery, maps transaction identifiers to
//! coordinators and opens items through the open-item table.
//!
//! Local transactions use [`begin`](TransactionManager::begin),
//! [`prepare`](TransactionManager::prepare),
//! [`commit`](TransactionManager::commit) and
//! [`rollback`](TransactionManager::rollback). Distributed transactions follow
//! the resource-manager contract through the `*_xa` methods.

use crate::config::Config;
use crate::coordinator::{
    CoordinatorRepository, EngineContext, PreparePolicy, TransactionCoordinator, TransactionInfo,
};
use crate::dir::{Area, DataDir};
use crate::error::{CoreError, CoreResult};
use crate::item::{
    committed_in, ensure_sentinel, read_committed, read_committed_blob, read_committed_points,
    BlobContent, BlobItem, OpenItem, Point, PointItem, RangeCaches, RangeItem, RangeMeta,
    RangeRead,
};
use crate::opener::OpenItemTable;
use crate::permits::PermitPool;
use crate::pool::TaskHandle;
use crate::recovery::{log_path, Recovered, RecoveryBootstrap, RecoveryReport, XidStatus};
use crate::recovery::DeadState;
use crate::sequence::PersistentSequence;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::timer::{RollbackScheduler, RollbackTarget};
use crate::types::{GlobalXid, ItemKey, ItemKind, Xid};
use crate::xa::{XaError, XaOutcome, XaResult, XaVote};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use xfstore_storage::{AllocatorFactory, BlobLocator, ItemId, StorageAllocator};

struct Inner {
    dir: DataDir,
    ctx: Arc<EngineContext>,
    coordinators: CoordinatorRepository,
    items: OpenItemTable,
    local_xids: PersistentSequence,
    next_handle: AtomicU64,
    scheduler: RollbackScheduler,
    stale: Mutex<BTreeMap<GlobalXid, XidStatus>>,
    report: RecoveryReport,
}

/// A transactional store rooted at one data directory.
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<Inner>,
}

impl TransactionManager {
    /// Opens the store at `path`, recovering any unfinished transactions.
    ///
    /// # Errors
    ///
    /// Returns `DataDirLocked` if another engine uses the directory,
    /// `RecoveryAborted` if a recovery log cannot be resolved, or an I/O or
    /// storage error.
    pub fn open(path: &Path, config: Config) -> CoreResult<Self> {
        let dir = DataDir::open(path, config.create_if_missing)?;
        let series = Arc::new(AllocatorFactory::new(&dir.area(Area::Series)));
        let points = Arc::new(AllocatorFactory::new(&dir.area(Area::Points)));
        let blobs = BlobLocator::new(&dir.area(Area::Blob))?;
        let xlog = dir.area(Area::Xlog);

        let Recovered {
            report,
            stale,
            max_order,
            max_local,
        } = RecoveryBootstrap {
            xlog: &xlog,
            series: &series,
            points: &points,
            blobs: &blobs,
            config: &config,
        }
        .run()?;
        ensure_sentinel(&blobs)?;

        let commit_order = PersistentSequence::open(&dir.area(Area::CommitOrder))?;
        commit_order.advance_past(max_order)?;
        let local_xids = PersistentSequence::open(&dir.area(Area::LocalXids))?;
        local_xids.advance_past(max_local)?;

        let stats = EngineStats::new();
        stats.record_recovered(report.resolved() as u64);
        let ctx = Arc::new(EngineContext {
            xlog,
            series,
            points,
            blobs,
            caches: Arc::new(RangeCaches::new(
                config.metadata_cache_capacity,
                config.operation_cache_capacity,
            )),
            permits: PermitPool::new(
                config.max_concurrent_workers,
                config.max_client_threads_per_transaction,
            ),
            commit_order,
            stats,
            config,
        });
        let inner = Arc::new(Inner {
            dir,
            ctx,
            coordinators: CoordinatorRepository::default(),
            items: OpenItemTable::new(),
            local_xids,
            next_handle: AtomicU64::new(1),
            scheduler: RollbackScheduler::start()?,
            stale: Mutex::new(stale),
            report,
        });
        let target: Weak<Inner> = Arc::downgrade(&inner);
        inner.scheduler.set_target(target);
        info!(path = %path.display(), recovered = inner.report.resolved(), "store opened");
        Ok(Self { inner })
    }

    /// Returns the data directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.dir.path()
    }

    /// Returns what startup recovery did.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.report
    }

    /// Returns the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.ctx.stats.snapshot()
    }

    /// Returns range metadata cache `(hits, misses)`.
    #[must_use]
    pub fn metadata_cache_counters(&self) -> (u64, u64) {
        self.inner.ctx.caches.metadata_counters()
    }

    /// Returns the number of item objects currently open.
    #[must_use]
    pub fn open_item_count(&self) -> usize {
        self.inner.items.len()
    }

    /// Begins a local transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the id sequence cannot be advanced on disk.
    pub fn begin(&self) -> CoreResult<Xid> {
        let xid = Xid::Local(self.inner.local_xids.next()?);
        let timeout = self.inner.ctx.config.auto_rollback_timeout;
        self.inner.register(&xid, timeout);
        Ok(xid)
    }

    /// Registers a distributed transaction. Starting a known transaction
    /// only updates its timeout.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if recovery already resolved `xid` and it
    /// has not been forgotten.
    pub fn start_xa(&self, xid: &GlobalXid, timeout: Option<Duration>) -> CoreResult<()> {
        if self.inner.stale.lock().contains_key(xid) {
            return Err(CoreError::invalid_operation(format!(
                "transaction {} awaits forget",
                Xid::Global(xid.clone())
            )));
        }
        let xid = Xid::Global(xid.clone());
        let timeout = timeout.unwrap_or(self.inner.ctx.config.auto_rollback_timeout);
        let (coordinator, created) = self.inner.register(&xid, timeout);
        if !created {
            coordinator.set_rollback_timeout(timeout);
        }
        Ok(())
    }

    /// Pushes the auto-rollback deadline of `xid` to `timeout` from now.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown transaction.
    pub fn set_transaction_timeout(&self, xid: &Xid, timeout: Duration) -> CoreResult<()> {
        self.inner.coordinator(xid)?.set_rollback_timeout(timeout);
        Ok(())
    }

    /// Opens a range item for `xid`, creating it when `create_new` is set and
    /// it does not exist in the transaction's view.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if the item does not exist and `create_new` is
    /// false, `LockTimeout` if another transaction holds it, or
    /// `EnrollmentClosed` once the transaction is preparing.
    pub fn open_range(&self, xid: &Xid, id: &ItemId, create_new: bool) -> CoreResult<Arc<RangeItem>> {
        match self.inner.open_item(xid, ItemKind::Range, id, create_new)? {
            OpenItem::Range(item) => Ok(item),
            other => Err(wrong_kind(&other, ItemKind::Range)),
        }
    }

    /// Opens a point item for `xid`.
    ///
    /// # Errors
    ///
    /// As [`open_range`](Self::open_range).
    pub fn open_points(&self, xid: &Xid, id: &ItemId, create_new: bool) -> CoreResult<Arc<PointItem>> {
        match self.inner.open_item(xid, ItemKind::Points, id, create_new)? {
            OpenItem::Points(item) => Ok(item),
            other => Err(wrong_kind(&other, ItemKind::Points)),
        }
    }

    /// Opens a blob item for `xid`.
    ///
    /// # Errors
    ///
    /// As [`open_range`](Self::open_range).
    pub fn open_blob(&self, xid: &Xid, id: &ItemId, create_new: bool) -> CoreResult<Arc<BlobItem>> {
        match self.inner.open_item(xid, ItemKind::Blob, id, create_new)? {
            OpenItem::Blob(item) => Ok(item),
            other => Err(wrong_kind(&other, ItemKind::Blob)),
        }
    }

    /// Drops a clean item from `xid`. Returns false if the transaction
    /// dirtied the item, which then stays enrolled.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown transaction.
    pub fn done_with_item(&self, xid: &Xid, kind: ItemKind, id: &ItemId) -> CoreResult<bool> {
        let coordinator = self.inner.coordinator(xid)?;
        let key = ItemKey::new(kind, id.clone());
        let removed = coordinator.remove_item(&key)?;
        if removed {
            self.inner.items.evict_if_unused(&key);
        }
        Ok(removed)
    }

    /// Returns true if the range item exists in `xid`'s view.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown transaction.
    pub fn range_item_exists(&self, xid: &Xid, id: &ItemId) -> CoreResult<bool> {
        self.inner.item_exists(xid, ItemKind::Range, id)
    }

    /// Returns true if the point item exists in `xid`'s view.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown transaction.
    pub fn point_item_exists(&self, xid: &Xid, id: &ItemId) -> CoreResult<bool> {
        self.inner.item_exists(xid, ItemKind::Points, id)
    }

    /// Returns true if the blob item exists in `xid`'s view.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown transaction.
    pub fn blob_item_exists(&self, xid: &Xid, id: &ItemId) -> CoreResult<bool> {
        self.inner.item_exists(xid, ItemKind::Blob, id)
    }

    /// Lists the committed items of `kind` under `path`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if an index cannot be read.
    pub fn find_ids(&self, kind: ItemKind, path: &str) -> CoreResult<Vec<ItemId>> {
        let ctx = &self.inner.ctx;
        let factory = match kind {
            ItemKind::Range => &ctx.series,
            ItemKind::Points => &ctx.points,
            ItemKind::Blob => return Ok(ctx.blobs.find_ids(path)?),
        };
        let Some(allocator) = factory.allocator_for_path(path, false)? else {
            return Ok(Vec::new());
        };
        let mut ids = Vec::new();
        for id in allocator.find_ids()? {
            if !allocator.is_new(&id)? {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Reads committed range content outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if no committed item exists.
    pub fn read_committed_range(&self, id: &ItemId, start: i64, len: usize) -> CoreResult<RangeRead> {
        let allocator = self.inner.committed_allocator(ItemKind::Range, id)?;
        let storage = allocator.storage(id)?;
        let meta = RangeMeta::decode(&storage.read_meta()?)?;
        read_committed(&storage, &meta, start, len)
    }

    /// Reads committed points in `[start, end]` outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if no committed item exists.
    pub fn read_committed_points(&self, id: &ItemId, start: f64, end: f64) -> CoreResult<Vec<Point>> {
        let allocator = self.inner.committed_allocator(ItemKind::Points, id)?;
        read_committed_points(&*allocator.storage(id)?, start, end)
    }

    /// Reads a committed blob outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if no committed blob exists.
    pub fn read_committed_blob(&self, id: &ItemId) -> CoreResult<BlobContent> {
        read_committed_blob(&self.inner.ctx.blobs, id)?
            .ok_or_else(|| CoreError::item_not_found(ItemKey::new(ItemKind::Blob, id.clone())))
    }

    /// Runs `task` on `xid`'s bounded client worker pool.
    ///
    /// Prepare waits for submitted work to finish.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown transaction.
    pub fn submit<F, T>(&self, xid: &Xid, task: F) -> CoreResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.coordinator(xid)?.submit(task)
    }

    /// Prepares a local transaction. Returns true if it is read-only.
    ///
    /// A failed prepare rolls the transaction back before returning.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown transaction, or the first
    /// item failure.
    pub fn prepare(&self, xid: &Xid) -> CoreResult<bool> {
        let coordinator = self.inner.coordinator(xid)?;
        match coordinator.prepare(&self.inner.ctx.permits, PreparePolicy::RollbackOnFailure) {
            Ok(read_only) => Ok(read_only),
            Err(error) => {
                self.inner.note_error(&error);
                self.inner.finish(&coordinator);
                self.inner.ctx.stats.record_rollback();
                Err(error)
            }
        }
    }

    /// Commits a local transaction, preparing it first if needed.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown transaction, a prepare
    /// failure (after rolling back), or a commit failure. A failure after the
    /// commit order is logged leaves the outcome to startup recovery.
    pub fn commit(&self, xid: &Xid) -> CoreResult<()> {
        let coordinator = self.inner.coordinator(xid)?;
        if !coordinator.is_prepared() {
            self.prepare(xid)?;
        }
        self.inner.commit_prepared(&coordinator)
    }

    /// Rolls a transaction back.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` if the transaction is unknown or already
    /// rolled back, and `InvalidOperation` while it commits.
    pub fn rollback(&self, xid: &Xid) -> CoreResult<()> {
        let coordinator = self.inner.coordinator(xid)?;
        self.inner.rollback(&coordinator)
    }

    /// Prepares a distributed transaction.
    ///
    /// A read-only branch is complete once this returns
    /// [`XaVote::ReadOnly`]. A failed prepare is not rolled back; the caller
    /// decides.
    ///
    /// # Errors
    ///
    /// Returns the outcome matching the prepare failure.
    pub fn prepare_xa(&self, xid: &GlobalXid) -> XaResult<XaVote> {
        let coordinator = self.inner.xa_coordinator(xid)?;
        match coordinator.prepare(&self.inner.ctx.permits, PreparePolicy::Surface) {
            Ok(true) => {
                self.inner.commit_prepared(&coordinator)?;
                Ok(XaVote::ReadOnly)
            }
            Ok(false) => Ok(XaVote::Ok),
            Err(error) => {
                self.inner.note_error(&error);
                Err(XaError::with_source(XaOutcome::for_prepare_failure(&error), error))
            }
        }
    }

    /// Commits a distributed transaction. With `one_phase` an unprepared
    /// branch is prepared first.
    ///
    /// # Errors
    ///
    /// Returns a heuristic outcome if recovery already resolved the branch
    /// differently, a rollback outcome if a one-phase prepare fails, or
    /// `HeuristicHazard` if the commit fails part way.
    pub fn commit_xa(&self, xid: &GlobalXid, one_phase: bool) -> XaResult<()> {
        if let Some(state) = self.inner.stale_state(xid) {
            return match state {
                DeadState::Committed => {
                    self.inner.forget(xid)?;
                    Ok(())
                }
                DeadState::Rollback => Err(heuristic(XaOutcome::HeuristicRollback, xid)),
                DeadState::HeuristicMixed => Err(heuristic(XaOutcome::HeuristicMixed, xid)),
            };
        }
        let coordinator = self.inner.xa_coordinator(xid)?;
        if !coordinator.is_prepared() {
            if !one_phase {
                return Err(XaError::new(
                    XaOutcome::ResourceManagerError,
                    format!("transaction {} is not prepared", coordinator.xid()),
                ));
            }
            if let Err(error) =
                coordinator.prepare(&self.inner.ctx.permits, PreparePolicy::RollbackOnFailure)
            {
                self.inner.note_error(&error);
                self.inner.finish(&coordinator);
                self.inner.ctx.stats.record_rollback();
                return Err(XaError::with_source(
                    XaOutcome::for_prepare_failure(&error),
                    error,
                ));
            }
        }
        self.inner
            .commit_prepared(&coordinator)
            .map_err(|error| XaError::with_source(XaOutcome::HeuristicHazard, error))
    }

    /// Rolls back a distributed transaction.
    ///
    /// # Errors
    ///
    /// Returns a heuristic outcome if recovery already resolved the branch
    /// differently, or `UnknownTransaction`.
    pub fn rollback_xa(&self, xid: &GlobalXid) -> XaResult<()> {
        if let Some(state) = self.inner.stale_state(xid) {
            return match state {
                DeadState::Rollback => {
                    self.inner.forget(xid)?;
                    Ok(())
                }
                DeadState::Committed => Err(heuristic(XaOutcome::HeuristicCommit, xid)),
                DeadState::HeuristicMixed => Err(heuristic(XaOutcome::HeuristicMixed, xid)),
            };
        }
        let coordinator = self.inner.xa_coordinator(xid)?;
        Ok(self.inner.rollback(&coordinator)?)
    }

    /// Discards the record of a distributed transaction resolved by recovery.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction` if no record exists.
    pub fn forget_xa(&self, xid: &GlobalXid) -> XaResult<()> {
        if self.inner.stale_state(xid).is_none() {
            return Err(XaError::unknown(Xid::Global(xid.clone())));
        }
        Ok(self.inner.forget(xid)?)
    }

    /// Lists distributed transactions awaiting a decision: those resolved by
    /// recovery and those prepared but not yet committed.
    #[must_use]
    pub fn recover_xa(&self) -> Vec<GlobalXid> {
        let mut ids: Vec<GlobalXid> = self.inner.stale.lock().keys().cloned().collect();
        for coordinator in self.inner.coordinators.all() {
            if let Xid::Global(global) = coordinator.xid() {
                if coordinator.is_prepared() {
                    ids.push(global.clone());
                }
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Returns the recorded outcomes of distributed transactions resolved by
    /// recovery.
    #[must_use]
    pub fn resolved_xa(&self) -> Vec<XidStatus> {
        self.inner.stale.lock().values().cloned().collect()
    }

    /// Rolls back the live transaction with administrative `handle`.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` if no transaction has that handle.
    pub fn force_rollback(&self, handle: u64) -> CoreResult<()> {
        let coordinator = self
            .inner
            .coordinators
            .by_handle(handle)
            .ok_or_else(|| CoreError::transaction_not_found(format!("handle {handle}")))?;
        warn!(xid = %coordinator.xid(), handle, "forced rollback");
        self.inner.rollback(&coordinator)
    }

    /// Rolls back every live transaction. Returns how many were rolled back.
    pub fn force_rollback_all(&self) -> usize {
        let mut count = 0;
        for coordinator in self.inner.coordinators.all() {
            match self.inner.rollback(&coordinator) {
                Ok(()) => count += 1,
                Err(error) => warn!(xid = %coordinator.xid(), %error, "forced rollback failed"),
            }
        }
        count
    }

    /// Returns diagnostics for every live transaction, oldest first.
    #[must_use]
    pub fn transactions(&self) -> Vec<TransactionInfo> {
        let mut infos: Vec<TransactionInfo> = self
            .inner
            .coordinators
            .all()
            .iter()
            .map(|c| c.monitoring_info())
            .collect();
        infos.sort_by_key(|info| info.handle);
        infos
    }

    /// Rolls back every transaction that is not prepared and stops the
    /// auto-rollback thread. Prepared transactions keep their logs for the
    /// next open.
    pub fn close(self) {
        for coordinator in self.inner.coordinators.all() {
            if coordinator.is_prepared() {
                continue;
            }
            if let Err(error) = self.inner.rollback(&coordinator) {
                warn!(xid = %coordinator.xid(), %error, "rollback at close failed");
            }
        }
        self.inner.scheduler.shutdown();
        debug!(path = %self.inner.dir.path().display(), "store closed");
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("path", &self.inner.dir.path())
            .field("transactions", &self.inner.coordinators.all().len())
            .field("open_items", &self.inner.items.len())
            .finish_non_exhaustive()
    }
}

fn wrong_kind(item: &OpenItem, expected: ItemKind) -> CoreError {
    CoreError::invalid_operation(format!(
        "open item is a {} item, expected {}",
        item.kind(),
        expected
    ))
}

fn heuristic(outcome: XaOutcome, xid: &GlobalXid) -> XaError {
    XaError::new(
        outcome,
        format!("transaction {} was resolved by recovery", Xid::Global(xid.clone())),
    )
}

impl Inner {
    fn register(&self, xid: &Xid, timeout: Duration) -> (Arc<TransactionCoordinator>, bool) {
        let (coordinator, created) = self.coordinators.get_or_insert(xid, || {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            let timer = self.scheduler.schedule(xid.clone(), timeout);
            Arc::new(TransactionCoordinator::new(
                Arc::clone(&self.ctx),
                xid.clone(),
                handle,
                timer,
            ))
        });
        if created {
            self.ctx.stats.record_begin();
            debug!(%xid, handle = coordinator.handle(), "transaction started");
        }
        (coordinator, created)
    }

    fn coordinator(&self, xid: &Xid) -> CoreResult<Arc<TransactionCoordinator>> {
        self.coordinators
            .get(xid)
            .ok_or_else(|| CoreError::transaction_not_found(xid))
    }

    fn xa_coordinator(&self, xid: &GlobalXid) -> XaResult<Arc<TransactionCoordinator>> {
        let xid = Xid::Global(xid.clone());
        self.coordinators
            .get(&xid)
            .ok_or_else(|| XaError::unknown(xid))
    }

    fn note_error(&self, error: &CoreError) {
        if error.is_lock_timeout() {
            self.ctx.stats.record_lock_timeout();
        }
    }

    /// Forgets a finished coordinator and evicts its idle items.
    fn finish(&self, coordinator: &TransactionCoordinator) {
        self.coordinators.remove(coordinator.xid());
        for key in coordinator.item_keys() {
            self.items.evict_if_unused(&key);
        }
    }

    fn commit_prepared(&self, coordinator: &TransactionCoordinator) -> CoreResult<()> {
        match coordinator.commit(&self.ctx.permits) {
            Ok(()) => {
                self.finish(coordinator);
                self.ctx.stats.record_commit();
                Ok(())
            }
            Err(error) => {
                self.note_error(&error);
                if !coordinator.is_prepared() {
                    warn!(xid = %coordinator.xid(), %error, "commit failed; recovery will resolve it");
                    self.coordinators.remove(coordinator.xid());
                }
                Err(error)
            }
        }
    }

    fn rollback(&self, coordinator: &TransactionCoordinator) -> CoreResult<()> {
        match coordinator.rollback() {
            Ok(()) => {
                self.finish(coordinator);
                self.ctx.stats.record_rollback();
                Ok(())
            }
            Err(error) if !coordinator.is_finished() => {
                self.note_error(&error);
                Err(error)
            }
            Err(error) => {
                self.note_error(&error);
                warn!(xid = %coordinator.xid(), %error, "rollback incomplete; recovery will finish it");
                self.finish(coordinator);
                Err(error)
            }
        }
    }

    fn open_item(
        &self,
        xid: &Xid,
        kind: ItemKind,
        id: &ItemId,
        create_new: bool,
    ) -> CoreResult<OpenItem> {
        let coordinator = self.coordinator(xid)?;
        let key = ItemKey::new(kind, id.clone());
        let allocator = match kind {
            ItemKind::Range => Some(self.find_allocator(&self.ctx.series, &key, create_new)?),
            ItemKind::Points => Some(self.find_allocator(&self.ctx.points, &key, create_new)?),
            ItemKind::Blob => None,
        };
        let ctx = &self.ctx;
        let timeout = ctx.config.lock_timeout;
        let load = || -> CoreResult<OpenItem> {
            let storage_allocator = || {
                allocator
                    .clone()
                    .ok_or_else(|| CoreError::item_not_found(&key))
            };
            Ok(match kind {
                ItemKind::Range => OpenItem::Range(Arc::new(RangeItem::new(
                    id.clone(),
                    storage_allocator()?,
                    Arc::clone(&ctx.caches),
                    timeout,
                ))),
                ItemKind::Points => OpenItem::Points(Arc::new(PointItem::new(
                    id.clone(),
                    storage_allocator()?,
                    timeout,
                ))),
                ItemKind::Blob => {
                    OpenItem::Blob(Arc::new(BlobItem::new(id.clone(), ctx.blobs.clone(), timeout)))
                }
            })
        };

        let known = coordinator.item_keys().contains(&key);
        let journals = coordinator.journals();
        let item = self
            .items
            .open(&key, xid, &journals, &self.coordinators, timeout, load)
            .inspect_err(|e| self.note_error(e))?;

        let enrolled = coordinator.add_item(&item, allocator).and_then(|()| {
            if item.exists_for(xid)? {
                return Ok(());
            }
            if create_new {
                item.create_for(xid)
            } else {
                Err(CoreError::item_not_found(&key))
            }
        });
        if let Err(error) = enrolled {
            if !known {
                self.undo_enrollment(&coordinator, &item, xid);
            }
            return Err(error);
        }
        Ok(item)
    }

    /// Removes a failed first enrollment from both the coordinator and the
    /// item.
    fn undo_enrollment(&self, coordinator: &TransactionCoordinator, item: &OpenItem, xid: &Xid) {
        let key = item.as_item().key().clone();
        if let Err(error) = coordinator.remove_item(&key) {
            debug!(%key, %error, "could not drop enrollment");
        }
        if item.as_item().knows_transaction(xid) && !coordinator.item_keys().contains(&key) {
            if let Err(error) = item.as_item().done_with(xid) {
                debug!(%key, %error, "could not release item");
            }
        }
        self.items.evict_if_unused(&key);
    }

    fn find_allocator(
        &self,
        factory: &AllocatorFactory,
        key: &ItemKey,
        create: bool,
    ) -> CoreResult<Arc<dyn StorageAllocator>> {
        factory
            .find_allocator(&key.id, create)?
            .ok_or_else(|| CoreError::item_not_found(key))
    }

    fn committed_allocator(&self, kind: ItemKind, id: &ItemId) -> CoreResult<Arc<dyn StorageAllocator>> {
        let factory = match kind {
            ItemKind::Points => &self.ctx.points,
            _ => &self.ctx.series,
        };
        let key = ItemKey::new(kind, id.clone());
        let allocator = self.find_allocator(factory, &key, false)?;
        if !committed_in(allocator.as_ref(), id)? {
            return Err(CoreError::item_not_found(key));
        }
        Ok(allocator)
    }

    fn item_exists(&self, xid: &Xid, kind: ItemKind, id: &ItemId) -> CoreResult<bool> {
        self.coordinator(xid)?;
        let key = ItemKey::new(kind, id.clone());
        if let Some(item) = self.items.get(&key) {
            if item.as_item().knows_transaction(xid) {
                return item.exists_for(xid);
            }
        }
        match kind {
            ItemKind::Blob => Ok(read_committed_blob(&self.ctx.blobs, id)?.is_some()),
            _ => match self.committed_allocator(kind, id) {
                Ok(_) => Ok(true),
                Err(CoreError::ItemNotFound { .. }) => Ok(false),
                Err(error) => Err(error),
            },
        }
    }

    fn stale_state(&self, xid: &GlobalXid) -> Option<DeadState> {
        self.stale.lock().get(xid).map(|status| status.state)
    }

    /// Drops the stale record of `xid` and its `d` log.
    fn forget(&self, xid: &GlobalXid) -> CoreResult<()> {
        let path = log_path(&self.ctx.xlog, &Xid::Global(xid.clone()));
        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.stale.lock().remove(xid);
        debug!(xid = %Xid::Global(xid.clone()), "forgot resolved transaction");
        Ok(())
    }
}

impl RollbackTarget for Inner {
    fn auto_rollback(&self, xid: &Xid) {
        let Some(coordinator) = self.coordinators.get(xid) else {
            return;
        };
        if coordinator.is_prepared() {
            return;
        }
        match self.rollback(&coordinator) {
            Ok(()) => {
                self.ctx.stats.record_auto_rollback();
                info!(%xid, "idle transaction rolled back");
            }
            Err(error) => warn!(%xid, %error, "auto-rollback failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultPoint;
    use tempfile::tempdir;

    fn config() -> Config {
        Config::new()
            .lock_timeout(Duration::from_millis(300))
            .sync_on_commit(false)
            .sync_on_recovery(false)
    }

    fn id(text: &str) -> ItemId {
        ItemId::parse(text).unwrap()
    }

    #[test]
    fn range_write_is_visible_after_commit() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::open(dir.path(), config()).unwrap();
        let t1 = tm.begin().unwrap();
        let item = tm.open_range(&t1, &id("/ts/a"), true).unwrap();
        item.write(&t1, 0, b"ABCD", 7).unwrap();
        assert!(!tm.prepare(&t1).unwrap());
        tm.commit(&t1).unwrap();

        let read = tm.read_committed_range(&id("/ts/a"), 0, 4).unwrap();
        assert_eq!(read.data, b"ABCD");
        assert_eq!(tm.stats().committed, 1);
        assert!(tm.transactions().is_empty());
    }

    #[test]
    fn missing_item_without_create_is_not_found() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::open(dir.path(), config()).unwrap();
        let t = tm.begin().unwrap();
        let err = tm.open_points(&t, &id("/pts/x"), false).unwrap_err();
        assert!(matches!(err, CoreError::ItemNotFound { .. }));
        assert!(!tm.point_item_exists(&t, &id("/pts/x")).unwrap());
        tm.rollback(&t).unwrap();
    }

    #[test]
    fn second_rollback_reports_unknown_transaction() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::open(dir.path(), config()).unwrap();
        let t = tm.begin().unwrap();
        let item = tm.open_blob(&t, &id("/blob/b"), true).unwrap();
        item.write(&t, 1, b"hello").unwrap();
        tm.rollback(&t).unwrap();
        let err = tm.rollback(&t).unwrap_err();
        assert!(matches!(err, CoreError::TransactionNotFound { .. }));
        assert!(tm.read_committed_blob(&id("/blob/b")).is_err());
    }

    #[test]
    fn points_round_trip_through_commit() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::open(dir.path(), config()).unwrap();
        let t = tm.begin().unwrap();
        let item = tm.open_points(&t, &id("/pts/a"), true).unwrap();
        let points = [
            Point::new(1.0, 10.0, 1),
            Point::new(2.0, 20.0, 1),
        ];
        item.write(&t, 0.0, 5.0, &points, false).unwrap();
        tm.commit(&t).unwrap();
        assert_eq!(tm.read_committed_points(&id("/pts/a"), 0.0, 5.0).unwrap(), points);
        assert_eq!(tm.find_ids(ItemKind::Points, "/pts").unwrap(), vec![id("/pts/a")]);
    }

    #[test]
    fn force_rollback_by_handle() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::open(dir.path(), config()).unwrap();
        let t = tm.begin().unwrap();
        let handle = tm.transactions()[0].handle;
        tm.force_rollback(handle).unwrap();
        assert!(tm.transactions().is_empty());
        assert!(tm.force_rollback(handle).is_err());
        assert_eq!(tm.stats().rolled_back, 1);
        assert!(matches!(tm.commit(&t), Err(CoreError::TransactionNotFound { .. })));
    }

    #[test]
    fn idle_transaction_is_rolled_back() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::open(
            dir.path(),
            config().auto_rollback_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        let t = tm.begin().unwrap();
        tm.open_range(&t, &id("/ts/idle"), true).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !tm.transactions().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(tm.transactions().is_empty());
        assert_eq!(tm.stats().auto_rollbacks, 1);
    }

    #[test]
    fn read_only_xa_branch_completes_at_prepare() {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::open(dir.path(), config()).unwrap();
        let g = GlobalXid::new(1, *b"g", *b"b");
        tm.start_xa(&g, None).unwrap();
        tm.start_xa(&g, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(tm.prepare_xa(&g).unwrap(), XaVote::ReadOnly);
        assert_eq!(
            tm.commit_xa(&g, false).unwrap_err().outcome,
            XaOutcome::UnknownTransaction
        );
    }

    #[test]
    fn prepared_xa_branch_survives_restart_and_rolls_back() {
        let dir = tempdir().unwrap();
        let g = GlobalXid::new(1, *b"g", *b"b");
        {
            let tm = TransactionManager::open(dir.path(), config()).unwrap();
            tm.start_xa(&g, None).unwrap();
            let x = Xid::Global(g.clone());
            let item = tm.open_range(&x, &id("/ts/xa"), true).unwrap();
            item.write(&x, 0, b"zz", 1).unwrap();
            assert_eq!(tm.prepare_xa(&g).unwrap(), XaVote::Ok);
            assert_eq!(tm.recover_xa(), vec![g.clone()]);
            tm.close();
        }
        let tm = TransactionManager::open(dir.path(), config()).unwrap();
        assert_eq!(tm.recover_xa(), vec![g.clone()]);
        assert_eq!(
            tm.commit_xa(&g, false).unwrap_err().outcome,
            XaOutcome::HeuristicRollback
        );
        tm.forget_xa(&g).unwrap();
        assert!(tm.recover_xa().is_empty());
        assert!(tm.read_committed_range(&id("/ts/xa"), 0, 2).is_err());
    }

    #[test]
    fn fault_after_commit_record_is_replayed_on_open() {
        let dir = tempdir().unwrap();
        {
            let tm = TransactionManager::open(
                dir.path(),
                config().fault_point(Some(FaultPoint::MidCommit)),
            )
            .unwrap();
            let t = tm.begin().unwrap();
            let item = tm.open_range(&t, &id("/ts/crash"), true).unwrap();
            item.write(&t, 0, b"WXYZ", 3).unwrap();
            assert!(matches!(
                tm.commit(&t),
                Err(CoreError::InjectedFault { .. })
            ));
        }
        let tm = TransactionManager::open(dir.path(), config()).unwrap();
        assert_eq!(tm.recovery_report().replayed.len(), 1);
        assert_eq!(tm.read_committed_range(&id("/ts/crash"), 0, 4).unwrap().data, b"WXYZ");
    }

    #[test]
    fn second_engine_on_same_directory_is_refused() {
        let dir = tempdir().unwrap();
        let _tm = TransactionManager::open(dir.path(), config()).unwrap();
        let err = TransactionManager::open(dir.path(), config()).unwrap_err();
        assert!(matches!(err, CoreError::DataDirLocked));
    }
}
