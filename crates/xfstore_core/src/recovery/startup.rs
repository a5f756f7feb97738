//! Startup recovery.
//!
//! Every log left in `xlog/` belongs to a transaction that did not finish.
//! Recovery first parses all of them; a single unreadable log aborts the
//! whole pass before anything is changed. Then:
//!
//! 1. committing transactions are replayed in commit order
//! 2. every other transaction is rolled back
//! 3. distributed transactions keep a `d` log so their manager can ask
//!    about the outcome later

use crate::config::Config;
use crate::dir::{sync_dir, Area};
use crate::error::CoreResult;
use crate::item::recover_blob;
use crate::recovery::consumer::{journal_source, JournalMerger, JournalWork, MergeMode};
use crate::recovery::log::{
    discard_files, journal_paths, parse_log, rewrite_status, DeadState, LogStatus, ParsedLog,
    LOCAL_EXT, POINTS_JOURNAL_EXT, RANGE_JOURNAL_EXT, XA_EXT,
};
use crate::router::{Consumer, Router};
use crate::types::{GlobalXid, Xid};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use xfstore_storage::{AllocatorFactory, BlobLocator};

const RECOVERY_CONSUMERS: usize = 4;

/// The recorded outcome of a distributed transaction resolved by recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidStatus {
    /// The distributed transaction.
    pub xid: GlobalXid,
    /// What recovery did with it.
    pub state: DeadState,
}

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transactions whose journals were replayed, in commit order.
    pub replayed: Vec<Xid>,
    /// Transactions rolled back.
    pub rolled_back: Vec<Xid>,
    /// Distributed transactions awaiting a decision from their manager.
    pub unresolved: Vec<GlobalXid>,
    /// Journals found without a log and removed.
    pub orphan_journals: usize,
}

impl RecoveryReport {
    /// Returns the number of transactions recovery resolved.
    #[must_use]
    pub fn resolved(&self) -> usize {
        self.replayed.len() + self.rolled_back.len()
    }
}

/// Everything the manager needs from a recovery pass.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    pub(crate) report: RecoveryReport,
    pub(crate) stale: BTreeMap<GlobalXid, XidStatus>,
    pub(crate) max_order: u64,
    pub(crate) max_local: u64,
}

/// Lists the logs and journals in `xlog`.
fn scan(xlog: &Path) -> CoreResult<(Vec<PathBuf>, Vec<(String, PathBuf)>)> {
    let mut logs = Vec::new();
    let mut journals = Vec::new();
    if !xlog.exists() {
        return Ok((logs, journals));
    }
    for entry in fs::read_dir(xlog)? {
        let path = entry?.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        match ext {
            LOCAL_EXT | XA_EXT => logs.push(path),
            RANGE_JOURNAL_EXT | POINTS_JOURNAL_EXT => journals.push((stem, path)),
            _ => {}
        }
    }
    logs.sort();
    Ok((logs, journals))
}

/// Parses every recovery log under `<data_dir>/xlog` without changing
/// anything.
///
/// # Errors
///
/// Returns `RecoveryAborted` for the first unreadable log.
pub fn inspect_logs(data_dir: &Path) -> CoreResult<Vec<ParsedLog>> {
    let (logs, _) = scan(&data_dir.join(Area::Xlog.name()))?;
    logs.iter().map(|path| parse_log(path)).collect()
}

/// Restores the store to a consistent state from leftover logs.
pub(crate) struct RecoveryBootstrap<'a> {
    pub(crate) xlog: &'a Path,
    pub(crate) series: &'a Arc<AllocatorFactory>,
    pub(crate) points: &'a Arc<AllocatorFactory>,
    pub(crate) blobs: &'a BlobLocator,
    pub(crate) config: &'a Config,
}

impl RecoveryBootstrap<'_> {
    pub(crate) fn run(&self) -> CoreResult<Recovered> {
        let (logs, journals) = scan(self.xlog)?;
        let parsed: Vec<ParsedLog> = logs
            .iter()
            .map(|path| parse_log(path))
            .collect::<CoreResult<_>>()
            .inspect_err(|e| error!(error = %e, "recovery aborted; store left untouched"))?;

        let mut recovered = Recovered::default();
        let stems: BTreeSet<String> = parsed.iter().map(ParsedLog::stem).collect();
        for (stem, path) in journals {
            if !stems.contains(&stem) {
                fs::remove_file(&path)?;
                recovered.report.orphan_journals += 1;
            }
        }

        let (mut committing, rest): (Vec<_>, Vec<_>) = parsed
            .into_iter()
            .partition(|log| log.status == LogStatus::Committing);
        committing.sort_by_key(|log| log.order);

        for log in &rest {
            if let Xid::Local(n) = log.xid {
                recovered.max_local = recovered.max_local.max(n);
            }
        }
        for log in &committing {
            if let Xid::Local(n) = log.xid {
                recovered.max_local = recovered.max_local.max(n);
            }
            recovered.max_order = recovered.max_order.max(log.order.unwrap_or_default());
            self.replay(log)?;
            self.finish(log, DeadState::Committed, &mut recovered)?;
            recovered.report.replayed.push(log.xid.clone());
        }

        for log in &rest {
            if let LogStatus::Dead(state) = log.status {
                self.keep_dead(log, state, &mut recovered);
                continue;
            }
            self.roll_back(log)?;
            self.finish(log, DeadState::Rollback, &mut recovered)?;
            recovered.report.rolled_back.push(log.xid.clone());
        }

        if self.config.sync_on_recovery && self.xlog.exists() {
            sync_dir(self.xlog)?;
        }
        if recovered.report.resolved() > 0 || !recovered.stale.is_empty() {
            info!(
                replayed = recovered.report.replayed.len(),
                rolled_back = recovered.report.rolled_back.len(),
                unresolved = recovered.report.unresolved.len(),
                orphans = recovered.report.orphan_journals,
                "recovery complete"
            );
        }
        Ok(recovered)
    }

    fn replay(&self, log: &ParsedLog) -> CoreResult<()> {
        let (range, points) = journal_paths(self.xlog, &log.stem());
        let merger = Arc::new(JournalMerger::new(
            MergeMode::Recovery,
            Arc::clone(self.series),
            Arc::clone(self.points),
        ));
        let source = journal_source(Some(&range), Some(&points))?;
        Router::run(
            format!("xfstore-recover-{}", log.stem()),
            source,
            Arc::clone(&merger) as Arc<dyn Consumer<JournalWork>>,
            RECOVERY_CONSUMERS.min(self.config.max_concurrent_workers.max(1)),
            self.config.router_queue_length,
        )?;
        merger.complete(self.config.sync_on_recovery)?;
        for id in &log.blobs {
            recover_blob(self.blobs, id, &log.stem(), true)?;
        }
        Ok(())
    }

    fn roll_back(&self, log: &ParsedLog) -> CoreResult<()> {
        let paths = log
            .ranges
            .iter()
            .map(|p| (self.series, p))
            .chain(log.points.iter().map(|p| (self.points, p)));
        for (factory, path) in paths {
            let Some(allocator) = factory.allocator_for_path(path, false)? else {
                continue;
            };
            allocator.remove_all_new_ids(None)?;
            allocator.gc_files()?;
            allocator.commit_pending_modifications()?;
        }
        for id in &log.blobs {
            recover_blob(self.blobs, id, &log.stem(), false)?;
        }
        Ok(())
    }

    /// Removes a resolved transaction's files, keeping a `d` log for
    /// distributed ones.
    fn finish(&self, log: &ParsedLog, state: DeadState, recovered: &mut Recovered) -> CoreResult<()> {
        let stem = log.stem();
        if !log.xid.is_global() {
            return discard_files(self.xlog, &log.path, &stem);
        }
        let (range, points) = journal_paths(self.xlog, &stem);
        for path in [range, points] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        rewrite_status(
            &log.path,
            LogStatus::Dead(state),
            self.config.sync_on_recovery,
        )?;
        self.keep_dead(log, state, recovered);
        Ok(())
    }

    fn keep_dead(&self, log: &ParsedLog, state: DeadState, recovered: &mut Recovered) {
        match &log.xid {
            Xid::Global(global) => {
                warn!(xid = %log.xid, ?state, "distributed transaction awaits its manager");
                recovered.report.unresolved.push(global.clone());
                recovered.stale.insert(
                    global.clone(),
                    XidStatus {
                        xid: global.clone(),
                        state,
                    },
                );
            }
            Xid::Local(_) => {
                if let Err(error) = discard_files(self.xlog, &log.path, &log.stem()) {
                    warn!(xid = %log.xid, %error, "could not remove finished log");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::item::ItemJournals;
    use crate::recovery::log::TransactionLog;
    use tempfile::tempdir;
    use xfstore_storage::ItemId;

    struct Store {
        _dir: tempfile::TempDir,
        xlog: PathBuf,
        series: Arc<AllocatorFactory>,
        points: Arc<AllocatorFactory>,
        blobs: BlobLocator,
        config: Config,
    }

    fn store() -> Store {
        let dir = tempdir().unwrap();
        let xlog = dir.path().join("xlog");
        fs::create_dir_all(&xlog).unwrap();
        Store {
            series: Arc::new(AllocatorFactory::new(&dir.path().join("series"))),
            points: Arc::new(AllocatorFactory::new(&dir.path().join("points"))),
            blobs: BlobLocator::new(&dir.path().join("blob")).unwrap(),
            config: Config::new().sync_on_recovery(false),
            xlog,
            _dir: dir,
        }
    }

    impl Store {
        fn run(&self) -> CoreResult<Recovered> {
            RecoveryBootstrap {
                xlog: &self.xlog,
                series: &self.series,
                points: &self.points,
                blobs: &self.blobs,
                config: &self.config,
            }
            .run()
        }
    }

    #[test]
    fn committing_log_is_replayed() {
        let s = store();
        let id = ItemId::parse("/ts/a").unwrap();
        let log = TransactionLog::new(&s.xlog, Xid::Local(9), false);
        log.record_range_path("/ts").unwrap();
        log.range_journal().unwrap().append(&id, 0, b"ABCD").unwrap();
        log.prepare_reached().unwrap();
        log.commit_reached(3).unwrap();

        let recovered = s.run().unwrap();
        assert_eq!(recovered.report.replayed, vec![Xid::Local(9)]);
        assert_eq!(recovered.max_order, 3);
        assert_eq!(recovered.max_local, 9);
        let allocator = s.series.allocator_for_path("/ts", false).unwrap().unwrap();
        assert!(!allocator.is_new(&id).unwrap());
        assert_eq!(allocator.storage(&id).unwrap().read_data(0, 4).unwrap(), b"ABCD");
        assert_eq!(fs::read_dir(&s.xlog).unwrap().count(), 0);
    }

    #[test]
    fn prepared_distributed_log_is_rolled_back_and_kept() {
        let s = store();
        let global = GlobalXid::new(7, *b"tm", *b"b1");
        let id = ItemId::parse("/ts/new").unwrap();
        let allocator = s.series.find_allocator(&id, true).unwrap().unwrap();
        allocator.create(&id).unwrap();
        allocator.commit_pending_modifications().unwrap();

        let log = TransactionLog::new(&s.xlog, Xid::Global(global.clone()), false);
        log.record_range_path("/ts").unwrap();
        log.range_journal().unwrap().append(&id, 0, b"zz").unwrap();
        log.prepare_reached().unwrap();

        let fresh = Arc::new(AllocatorFactory::new(s.series.root()));
        let recovered = RecoveryBootstrap {
            xlog: &s.xlog,
            series: &fresh,
            points: &s.points,
            blobs: &s.blobs,
            config: &s.config,
        }
        .run()
        .unwrap();
        assert_eq!(recovered.report.rolled_back.len(), 1);
        assert_eq!(recovered.stale[&global].state, DeadState::Rollback);
        let allocator = fresh.allocator_for_path("/ts", false).unwrap().unwrap();
        assert!(!allocator.has_item(&id).unwrap());

        let parsed = parse_log(log.path()).unwrap();
        assert_eq!(parsed.status, LogStatus::Dead(DeadState::Rollback));
        assert!(!s.xlog.join(format!("{}.journal", parsed.stem())).exists());
    }

    #[test]
    fn damaged_log_changes_nothing() {
        let s = store();
        let good = TransactionLog::new(&s.xlog, Xid::Local(1), false);
        good.record_range_path("/ts").unwrap();
        good.prepare_reached().unwrap();
        good.commit_reached(1).unwrap();
        fs::write(s.xlog.join("L2.local"), "?\n").unwrap();

        let err = s.run().unwrap_err();
        assert!(matches!(err, CoreError::RecoveryAborted { .. }));
        assert!(good.path().exists());
        assert_eq!(inspect_logs(s.xlog.parent().unwrap()).unwrap_err().to_string(), err.to_string());
    }

    #[test]
    fn orphan_journals_are_removed() {
        let s = store();
        fs::write(s.xlog.join("L5.journal"), b"").unwrap();
        let recovered = s.run().unwrap();
        assert_eq!(recovered.report.orphan_journals, 1);
        assert_eq!(recovered.report.resolved(), 0);
    }
}
