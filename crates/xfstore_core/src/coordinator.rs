//! Per-transaction coordination.
//!
//! A [`TransactionCoordinator`] tracks the items enrolled in one transaction
//! and drives them through prepare, commit and rollback:
//!
//! - **prepare**: drain client work, take worker permits, take every item's
//!   transaction lock in [`ItemKey`] order, then fan out item prepares
//! - **commit**: log the commit order, merge the journals into storage, then
//!   fan out item commits
//! - **rollback**: fan out item rollbacks and drop storage the transaction
//!   created
//!
//! Fan-outs run on a [`Router`] keyed by item, and while a commit runs a
//! blocked thread of another transaction may join it through
//! [`TransactionCoordinator::accelerate_commit`].

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::fault::{self, FaultPoint};
use crate::item::{ItemJournals, OpenItem, RangeCaches, TransactionalItem};
use crate::lock::LockLevel;
use crate::permits::{PermitPool, Throttle, UnboundedThrottle};
use crate::pool::{TaskHandle, WorkerPool};
use crate::recovery::{journal_source, JournalMerger, MergeMode, TransactionLog};
use crate::router::{Consumer, Donatable, Router, RoutingKey};
use crate::sequence::PersistentSequence;
use crate::stats::EngineStats;
use crate::timer::AutoRollback;
use crate::types::{ItemKey, ItemKind, Xid};
use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use xfstore_storage::{AllocatorFactory, BlobLocator, ItemId, StorageAllocator};

/// Engine-wide collaborators shared by every coordinator.
pub(crate) struct EngineContext {
    pub(crate) config: Config,
    pub(crate) xlog: PathBuf,
    pub(crate) series: Arc<AllocatorFactory>,
    pub(crate) points: Arc<AllocatorFactory>,
    pub(crate) blobs: BlobLocator,
    pub(crate) caches: Arc<RangeCaches>,
    pub(crate) permits: PermitPool,
    pub(crate) commit_order: PersistentSequence,
    pub(crate) stats: EngineStats,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("xlog", &self.xlog)
            .field("permits", &self.permits)
            .finish_non_exhaustive()
    }
}

/// What prepare does when an item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparePolicy {
    /// Roll the transaction back before returning the error.
    RollbackOnFailure,
    /// Return the error and leave the outcome to the caller.
    Surface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Prepared { read_only: bool },
    Committing,
    Finished,
}

/// A live-transaction diagnostic snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Short numeric handle for administrative commands.
    pub handle: u64,
    /// The transaction identifier.
    pub xid: Xid,
    /// When the transaction began.
    pub started: SystemTime,
    /// When the transaction will be rolled back if still idle.
    pub auto_rollback_deadline: Option<SystemTime>,
    /// What the transaction is doing.
    pub status: String,
    /// Number of enrolled items.
    pub items: usize,
}

/// One item routed through a fan-out.
struct ItemTask(Arc<dyn TransactionalItem>);

impl RoutingKey for ItemTask {
    fn routing_key(&self) -> u64 {
        let key = self.0.key();
        key.id.stable_hash().wrapping_add(key.kind as u64)
    }
}

/// Orchestrates one transaction.
pub struct TransactionCoordinator {
    xid: Xid,
    handle: u64,
    started: SystemTime,
    ctx: Arc<EngineContext>,
    log: Arc<TransactionLog>,
    phase: RwLock<Phase>,
    items: Mutex<BTreeMap<ItemKey, Arc<dyn TransactionalItem>>>,
    allocators: Mutex<BTreeMap<(ItemKind, String), Arc<dyn StorageAllocator>>>,
    pool: WorkerPool,
    status: Mutex<String>,
    fan_out: Mutex<Option<Arc<dyn Donatable>>>,
    commit_begun: Mutex<bool>,
    commit_signal: Condvar,
    auto_rollback: AutoRollback,
}

impl TransactionCoordinator {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        xid: Xid,
        handle: u64,
        auto_rollback: AutoRollback,
    ) -> Self {
        let log = Arc::new(TransactionLog::new(
            &ctx.xlog,
            xid.clone(),
            ctx.config.sync_on_commit,
        ));
        let pool = WorkerPool::new(
            format!("xfstore-{}", xid.file_stem()),
            ctx.config.max_client_threads_per_transaction,
        );
        Self {
            xid,
            handle,
            started: SystemTime::now(),
            ctx,
            log,
            phase: RwLock::new(Phase::Active),
            items: Mutex::new(BTreeMap::new()),
            allocators: Mutex::new(BTreeMap::new()),
            pool,
            status: Mutex::new("active".to_string()),
            fan_out: Mutex::new(None),
            commit_begun: Mutex::new(false),
            commit_signal: Condvar::new(),
            auto_rollback,
        }
    }

    /// Returns the transaction identifier.
    #[must_use]
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// Returns the administrative handle.
    #[must_use]
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Returns the journals items of this transaction write to.
    pub(crate) fn journals(&self) -> Arc<dyn ItemJournals> {
        Arc::clone(&self.log) as Arc<dyn ItemJournals>
    }

    /// Returns true once prepare succeeded and no outcome was applied.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        matches!(*self.phase.read(), Phase::Prepared { .. })
    }

    /// Returns true once commit or rollback has ended the transaction.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(*self.phase.read(), Phase::Finished)
    }

    fn timeout(&self) -> Duration {
        self.ctx.config.lock_timeout
    }

    fn coordinator_timeout(&self) -> CoreError {
        CoreError::lock_timeout(
            format!("transaction {}", self.xid),
            LockLevel::Coordinator,
            &self.xid,
            Some(self.status.lock().clone()),
            0,
            self.timeout(),
        )
    }

    fn lock_phase(&self) -> CoreResult<RwLockWriteGuard<'_, Phase>> {
        self.phase
            .try_write_for(self.timeout())
            .ok_or_else(|| self.coordinator_timeout())
    }

    fn set_status(&self, status: &str) {
        status.clone_into(&mut self.status.lock());
    }

    /// Enrolls an item that has already begun the transaction.
    ///
    /// # Errors
    ///
    /// Returns `EnrollmentClosed` once prepare started, or a log error.
    pub(crate) fn add_item(
        &self,
        item: &OpenItem,
        allocator: Option<Arc<dyn StorageAllocator>>,
    ) -> CoreResult<()> {
        let phase = self
            .phase
            .try_read_for(self.timeout())
            .ok_or_else(|| self.coordinator_timeout())?;
        if *phase != Phase::Active {
            return Err(CoreError::enrollment_closed(&self.xid));
        }
        let shared = item.to_shared();
        let key = shared.key().clone();
        match key.kind {
            ItemKind::Range => self.log.record_range_path(key.id.path())?,
            ItemKind::Points => self.log.record_points_path(key.id.path())?,
            ItemKind::Blob => {}
        }
        if let Some(allocator) = allocator {
            self.allocators
                .lock()
                .insert((key.kind, key.id.path().to_string()), allocator);
        }
        self.items.lock().insert(key, shared);
        Ok(())
    }

    /// Drops an item the transaction never dirtied.
    ///
    /// Returns false if the item is dirty and stays enrolled.
    pub(crate) fn remove_item(&self, key: &ItemKey) -> CoreResult<bool> {
        let _phase = self
            .phase
            .try_read_for(self.timeout())
            .ok_or_else(|| self.coordinator_timeout())?;
        let Some(item) = self.items.lock().get(key).cloned() else {
            return Ok(true);
        };
        if !item.done_with(&self.xid)? {
            return Ok(false);
        }
        self.items.lock().remove(key);
        Ok(true)
    }

    /// Returns the keys of every enrolled item.
    #[must_use]
    pub fn item_keys(&self) -> Vec<ItemKey> {
        self.items.lock().keys().cloned().collect()
    }

    fn sorted_items(&self) -> Vec<Arc<dyn TransactionalItem>> {
        self.items.lock().values().cloned().collect()
    }

    fn touched_allocators(&self) -> Vec<Arc<dyn StorageAllocator>> {
        self.allocators.lock().values().cloned().collect()
    }

    /// Runs `task` on the transaction's client worker pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` once the transaction is finishing.
    pub fn submit<F, T>(&self, task: F) -> CoreResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.pool.submit(task)
    }

    /// Pushes the auto-rollback deadline to `timeout` from now.
    pub fn set_rollback_timeout(&self, timeout: Duration) {
        self.auto_rollback.reschedule(timeout);
    }

    /// Applies `op` to every item, in parallel when there is more than one.
    fn fan_out<F>(
        &self,
        name: &str,
        items: &[Arc<dyn TransactionalItem>],
        workers: usize,
        op: F,
    ) -> CoreResult<()>
    where
        F: Fn(&dyn TransactionalItem, &Xid) -> CoreResult<()> + Send + Sync + 'static,
    {
        if items.len() <= 1 {
            return items.iter().try_for_each(|item| op(item.as_ref(), &self.xid));
        }
        let xid = self.xid.clone();
        let consumer: Arc<dyn Consumer<ItemTask>> =
            Arc::new(move |task: ItemTask| op(task.0.as_ref(), &xid));
        let tasks: Vec<CoreResult<ItemTask>> =
            items.iter().map(|item| Ok(ItemTask(Arc::clone(item)))).collect();
        let router = Router::start(
            format!("xfstore-{name}-{}", self.handle),
            Box::new(tasks.into_iter()),
            consumer,
            workers.min(items.len()),
            self.ctx.config.router_queue_length,
        )?;
        self.run_published(&router)
    }

    /// Waits for a router run while letting other threads donate to it.
    fn run_published<T>(&self, router: &Router<T>) -> CoreResult<()>
    where
        T: RoutingKey + Send + 'static,
    {
        *self.fan_out.lock() = Some(Arc::new(router.clone()) as Arc<dyn Donatable>);
        let result = router.wait_for_completion();
        *self.fan_out.lock() = None;
        let summary = result?;
        debug!(xid = %self.xid, consumed = summary.consumed, consumers = summary.consumers, "fan-out done");
        Ok(())
    }

    /// Prepares every enrolled item. Returns true if the transaction is
    /// read-only.
    ///
    /// # Errors
    ///
    /// Returns the first item failure. Under
    /// [`PreparePolicy::RollbackOnFailure`] the transaction is rolled back
    /// first.
    pub fn prepare(&self, throttle: &dyn Throttle, policy: PreparePolicy) -> CoreResult<bool> {
        let mut phase = self.lock_phase()?;
        match *phase {
            Phase::Active => {}
            Phase::Prepared { read_only } => return Ok(read_only),
            Phase::Committing | Phase::Finished => {
                return Err(CoreError::invalid_operation(format!(
                    "transaction {} is already finishing",
                    self.xid
                )))
            }
        }
        self.set_status("preparing");
        match self.prepare_items(throttle) {
            Ok(read_only) => {
                *phase = Phase::Prepared { read_only };
                self.auto_rollback.cancel();
                self.set_status(if read_only { "prepared, read-only" } else { "prepared" });
                debug!(xid = %self.xid, read_only, "prepared");
                Ok(read_only)
            }
            Err(error) => {
                if policy == PreparePolicy::RollbackOnFailure {
                    if let Err(rollback_error) = self.rollback_items() {
                        warn!(xid = %self.xid, %rollback_error, "rollback after failed prepare failed");
                    }
                    *phase = Phase::Finished;
                } else {
                    self.set_status("prepare failed");
                }
                Err(error)
            }
        }
    }

    fn prepare_items(&self, throttle: &dyn Throttle) -> CoreResult<bool> {
        let items = self.sorted_items();
        if items.is_empty() {
            return Ok(true);
        }
        self.pool.drain(self.timeout())?;
        let permits = throttle.acquire(self.timeout())?;
        for item in &items {
            item.acquire_transaction_lock(&self.xid, self.timeout())?;
        }
        self.fan_out("prepare", &items, permits.count(), |item, xid| {
            item.prepare_transaction(xid)
        })?;
        permits.release();

        if !items.iter().any(|item| item.is_dirty(&self.xid)) {
            return Ok(true);
        }
        for allocator in self.touched_allocators() {
            allocator.commit_pending_modifications()?;
        }
        self.log.prepare_reached()?;
        Ok(false)
    }

    /// Commits a prepared transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not prepared. A
    /// failure after the commit order is logged leaves the transaction for
    /// startup recovery.
    pub fn commit(&self, throttle: &dyn Throttle) -> CoreResult<()> {
        let mut phase = self.lock_phase()?;
        let read_only = match *phase {
            Phase::Prepared { read_only } => read_only,
            _ => {
                return Err(CoreError::invalid_operation(format!(
                    "transaction {} is not prepared",
                    self.xid
                )))
            }
        };
        let items = self.sorted_items();
        if read_only {
            for item in &items {
                item.commit_transaction(&self.xid)?;
            }
            self.log.discard()?;
            *phase = Phase::Finished;
            self.pool.shutdown();
            return Ok(());
        }

        *phase = Phase::Committing;
        self.set_status("committing");
        fault::check(self.ctx.config.fault_point, FaultPoint::AfterPrepare)?;
        let order = self.ctx.commit_order.next()?;
        self.log.commit_reached(order)?;
        *self.commit_begun.lock() = true;
        self.commit_signal.notify_all();

        let permits = throttle.acquire(self.timeout())?;
        let merger = Arc::new(JournalMerger::new(
            MergeMode::Commit,
            Arc::clone(&self.ctx.series),
            Arc::clone(&self.ctx.points),
        ));
        let (range, points) = self.log.journal_files();
        let source = journal_source(range.as_deref(), points.as_deref())?;
        let router = Router::start(
            format!("xfstore-merge-{}", self.handle),
            source,
            Arc::clone(&merger) as Arc<dyn Consumer<_>>,
            permits.count(),
            self.ctx.config.router_queue_length,
        )?;
        self.run_published(&router)?;
        merger.complete(self.ctx.config.sync_on_commit)?;
        fault::check(self.ctx.config.fault_point, FaultPoint::MidCommit)?;

        self.fan_out("commit", &items, permits.count(), |item, xid| {
            item.commit_transaction(xid)
        })?;
        for allocator in self.touched_allocators() {
            allocator.commit_pending_modifications()?;
        }
        permits.release();
        fault::check(
            self.ctx.config.fault_point,
            FaultPoint::AfterCommitBeforeCleanup,
        )?;

        self.log.discard()?;
        *phase = Phase::Finished;
        self.pool.shutdown();
        debug!(xid = %self.xid, order, items = items.len(), "committed");
        Ok(())
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` if the transaction already finished and
    /// `InvalidOperation` while its commit runs.
    pub fn rollback(&self) -> CoreResult<()> {
        let mut phase = self.lock_phase()?;
        match *phase {
            Phase::Finished => return Err(CoreError::transaction_not_found(&self.xid)),
            Phase::Committing => {
                return Err(CoreError::invalid_operation(format!(
                    "transaction {} is committing",
                    self.xid
                )))
            }
            Phase::Active | Phase::Prepared { .. } => {}
        }
        let result = self.rollback_items();
        *phase = Phase::Finished;
        result
    }

    /// Rolls back every item and releases every hold, even past failures.
    /// Returns the first failure and keeps the log for startup recovery.
    fn rollback_items(&self) -> CoreResult<()> {
        self.set_status("rolling back");
        self.auto_rollback.cancel();
        let mut first_error = None;
        self.keep_first(&mut first_error, "log", self.log.rollback_reached());
        if let Err(error) = self.pool.drain(self.timeout()) {
            warn!(xid = %self.xid, %error, "client work still running at rollback");
        }
        self.pool.shutdown();

        let items = self.sorted_items();
        let created: Vec<(Arc<dyn StorageAllocator>, ItemId)> = items
            .iter()
            .filter_map(|item| item.created_in(&self.xid))
            .collect();
        let failed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&failed);
        let fanned = UnboundedThrottle(self.ctx.config.max_client_threads_per_transaction)
            .acquire(self.timeout())
            .and_then(|permits| {
                self.fan_out("rollback", &items, permits.count(), move |item, xid| {
                    if let Err(error) = item.rollback_transaction(xid) {
                        sink.lock().get_or_insert(error);
                    }
                    Ok(())
                })
            });
        self.keep_first(&mut first_error, "items", fanned);
        if let Some(error) = failed.lock().take() {
            self.keep_first(&mut first_error, "item", Err(error));
        }
        for item in &items {
            item.release_transaction_lock(&self.xid);
        }

        let mut by_path: BTreeMap<String, (Arc<dyn StorageAllocator>, Vec<ItemId>)> =
            BTreeMap::new();
        for (allocator, id) in created {
            by_path
                .entry(allocator.path().to_string())
                .or_insert_with(|| (allocator, Vec::new()))
                .1
                .push(id);
        }
        for (allocator, ids) in by_path.into_values() {
            let removed = allocator
                .remove_all_new_ids(Some(&ids))
                .and_then(|_| allocator.gc_files())
                .and_then(|_| allocator.commit_pending_modifications())
                .map_err(CoreError::from);
            self.keep_first(&mut first_error, "allocator", removed);
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        self.log.discard()?;
        debug!(xid = %self.xid, items = items.len(), "rolled back");
        Ok(())
    }

    fn keep_first(&self, first: &mut Option<CoreError>, step: &str, result: CoreResult<()>) {
        if let Err(error) = result {
            warn!(xid = %self.xid, step, %error, "rollback step failed");
            first.get_or_insert(error);
        }
    }

    /// Waits up to `wait` for this transaction's commit to start, then joins
    /// its running fan-out as an extra consumer.
    ///
    /// Returns true if the calling thread did work for the commit.
    pub fn accelerate_commit(&self, wait: Duration) -> bool {
        let mut begun = self.commit_begun.lock();
        if !*begun {
            self.commit_signal.wait_for(&mut begun, wait);
        }
        if !*begun {
            return false;
        }
        drop(begun);
        let running = self.fan_out.lock().clone();
        running.is_some_and(|router| router.donate())
    }

    /// Returns a diagnostic snapshot.
    #[must_use]
    pub fn monitoring_info(&self) -> TransactionInfo {
        TransactionInfo {
            handle: self.handle,
            xid: self.xid.clone(),
            started: self.started,
            auto_rollback_deadline: self.auto_rollback.deadline_time(),
            status: self.status.lock().clone(),
            items: self.items.lock().len(),
        }
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("xid", &self.xid)
            .field("handle", &self.handle)
            .field("status", &*self.status.lock())
            .field("items", &self.items.lock().len())
            .finish_non_exhaustive()
    }
}

/// The live transactions of an engine, by identifier.
#[derive(Debug, Default)]
pub(crate) struct CoordinatorRepository {
    coordinators: RwLock<BTreeMap<Xid, Arc<TransactionCoordinator>>>,
}

impl CoordinatorRepository {
    pub(crate) fn get(&self, xid: &Xid) -> Option<Arc<TransactionCoordinator>> {
        self.coordinators.read().get(xid).cloned()
    }

    pub(crate) fn by_handle(&self, handle: u64) -> Option<Arc<TransactionCoordinator>> {
        self.coordinators
            .read()
            .values()
            .find(|c| c.handle() == handle)
            .cloned()
    }

    /// Inserts `make()` unless `xid` is already present, and returns the entry.
    pub(crate) fn get_or_insert(
        &self,
        xid: &Xid,
        make: impl FnOnce() -> Arc<TransactionCoordinator>,
    ) -> (Arc<TransactionCoordinator>, bool) {
        let mut coordinators = self.coordinators.write();
        if let Some(existing) = coordinators.get(xid) {
            return (Arc::clone(existing), false);
        }
        let created = make();
        coordinators.insert(xid.clone(), Arc::clone(&created));
        (created, true)
    }

    pub(crate) fn remove(&self, xid: &Xid) -> Option<Arc<TransactionCoordinator>> {
        self.coordinators.write().remove(xid)
    }

    pub(crate) fn all(&self) -> Vec<Arc<TransactionCoordinator>> {
        self.coordinators.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::RangeItem;
    use crate::timer::RollbackScheduler;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        ctx: Arc<EngineContext>,
        scheduler: RollbackScheduler,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let config = Config::new().lock_timeout(Duration::from_millis(200));
        let ctx = Arc::new(EngineContext {
            xlog: root.join("xlog"),
            series: Arc::new(AllocatorFactory::new(&root.join("series"))),
            points: Arc::new(AllocatorFactory::new(&root.join("points"))),
            blobs: BlobLocator::new(&root.join("blob")).unwrap(),
            caches: Arc::new(RangeCaches::new(16, 16)),
            permits: PermitPool::new(4, 4),
            commit_order: PersistentSequence::open(&root.join("commit-order.seq")).unwrap(),
            stats: EngineStats::new(),
            config,
        });
        std::fs::create_dir_all(&ctx.xlog).unwrap();
        Fixture {
            _dir: dir,
            ctx,
            scheduler: RollbackScheduler::start().unwrap(),
        }
    }

    impl Fixture {
        fn coordinator(&self, n: u64) -> TransactionCoordinator {
            let xid = Xid::Local(n);
            let timer = self.scheduler.schedule(xid.clone(), Duration::from_secs(60));
            TransactionCoordinator::new(Arc::clone(&self.ctx), xid, n, timer)
        }

        fn range(&self, coordinator: &TransactionCoordinator, name: &str) -> Arc<RangeItem> {
            let id = ItemId::parse(name).unwrap();
            let allocator = self.ctx.series.find_allocator(&id, true).unwrap().unwrap();
            let item = Arc::new(RangeItem::new(
                id,
                Arc::clone(&allocator),
                Arc::clone(&self.ctx.caches),
                self.ctx.config.lock_timeout,
            ));
            let open = OpenItem::Range(Arc::clone(&item));
            assert!(open.begin(coordinator.xid(), &coordinator.journals()));
            open.create_for(coordinator.xid()).unwrap();
            coordinator.add_item(&open, Some(allocator)).unwrap();
            item
        }
    }

    #[test]
    fn empty_transaction_is_read_only() {
        let f = fixture();
        let c = f.coordinator(1);
        assert!(c.prepare(&f.ctx.permits, PreparePolicy::Surface).unwrap());
        c.commit(&f.ctx.permits).unwrap();
        assert!(c.rollback().is_err());
    }

    #[test]
    fn prepare_and_commit_write_storage() {
        let f = fixture();
        let c = f.coordinator(1);
        let a = f.range(&c, "/ts/a");
        let b = f.range(&c, "/ts/b");
        a.write(c.xid(), 0, b"ABCD", 1).unwrap();
        b.write(c.xid(), 2, b"xy", 1).unwrap();

        assert!(!c.prepare(&f.ctx.permits, PreparePolicy::Surface).unwrap());
        assert!(c.is_prepared());
        c.commit(&f.ctx.permits).unwrap();

        let allocator = f.ctx.series.allocator_for_path("/ts", false).unwrap().unwrap();
        let storage = allocator.storage(a.id()).unwrap();
        assert_eq!(storage.read_data(0, 4).unwrap(), b"ABCD");
        assert!(!allocator.is_new(b.id()).unwrap());
        assert!(!a.has_transactions());
        assert_eq!(std::fs::read_dir(&f.ctx.xlog).unwrap().count(), 0);
    }

    #[test]
    fn rollback_forgets_created_items() {
        let f = fixture();
        let c = f.coordinator(2);
        let a = f.range(&c, "/ts/new");
        a.write(c.xid(), 0, b"zz", 1).unwrap();
        c.rollback().unwrap();

        let allocator = f.ctx.series.allocator_for_path("/ts", false).unwrap().unwrap();
        assert!(!allocator.has_item(a.id()).unwrap());
        assert!(a.item_lock().transaction_lock_holder().is_none());
        assert!(matches!(
            c.rollback(),
            Err(CoreError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn failed_item_rollback_still_frees_every_item() {
        let f = fixture();
        let c = f.coordinator(6);
        let stuck = f.range(&c, "/ts/stuck");
        let free = f.range(&c, "/ts/free");
        stuck.write(c.xid(), 0, b"s", 1).unwrap();
        free.write(c.xid(), 0, b"f", 1).unwrap();

        let reader = stuck
            .item_lock()
            .read(c.xid(), Duration::from_millis(10))
            .unwrap();
        assert!(matches!(c.rollback(), Err(CoreError::LockTimeout { .. })));
        drop(reader);

        assert!(stuck.item_lock().transaction_lock_holder().is_none());
        assert!(free.item_lock().transaction_lock_holder().is_none());
        let allocator = f.ctx.series.allocator_for_path("/ts", false).unwrap().unwrap();
        assert!(!allocator.has_item(stuck.id()).unwrap());
        assert!(!allocator.has_item(free.id()).unwrap());
        assert!(matches!(
            c.rollback(),
            Err(CoreError::TransactionNotFound { .. })
        ));

        let next = f.coordinator(7);
        let reopened = f.range(&next, "/ts/stuck");
        reopened.write(next.xid(), 0, b"n", 1).unwrap();
        next.prepare(&f.ctx.permits, PreparePolicy::Surface).unwrap();
        next.commit(&f.ctx.permits).unwrap();
        assert_eq!(
            allocator.storage(reopened.id()).unwrap().read_data(0, 1).unwrap(),
            b"n"
        );
    }

    #[test]
    fn enrollment_closes_at_prepare() {
        let f = fixture();
        let c = f.coordinator(3);
        let a = f.range(&c, "/ts/a");
        a.write(c.xid(), 0, b"q", 1).unwrap();
        c.prepare(&f.ctx.permits, PreparePolicy::Surface).unwrap();

        let id = ItemId::parse("/ts/late").unwrap();
        let allocator = f.ctx.series.find_allocator(&id, true).unwrap().unwrap();
        let late = OpenItem::Range(Arc::new(RangeItem::new(
            id,
            allocator,
            Arc::clone(&f.ctx.caches),
            f.ctx.config.lock_timeout,
        )));
        assert!(matches!(
            c.add_item(&late, None),
            Err(CoreError::EnrollmentClosed { .. })
        ));
        c.rollback().unwrap();
    }

    #[test]
    fn injected_fault_leaves_commit_record() {
        let mut f = fixture();
        Arc::get_mut(&mut f.ctx).unwrap().config.fault_point = Some(FaultPoint::MidCommit);
        let c = f.coordinator(4);
        let a = f.range(&c, "/ts/a");
        a.write(c.xid(), 0, b"ok", 1).unwrap();
        c.prepare(&f.ctx.permits, PreparePolicy::Surface).unwrap();
        assert!(matches!(
            c.commit(&f.ctx.permits),
            Err(CoreError::InjectedFault { .. })
        ));
        let parsed = crate::recovery::parse_log(&f.ctx.xlog.join("L4.local")).unwrap();
        assert_eq!(parsed.status, crate::recovery::LogStatus::Committing);
    }

    #[test]
    fn accelerate_without_commit_times_out() {
        let f = fixture();
        let c = f.coordinator(5);
        assert!(!c.accelerate_commit(Duration::from_millis(20)));
    }
}
