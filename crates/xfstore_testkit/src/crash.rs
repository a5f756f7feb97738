//! Crash recovery testing for xfstore.
//!
//! Each scenario commits a baseline to one range, one points and one blob
//! item, starts a second transaction that changes all three, stops it at a
//! [`CrashPoint`], drops the manager without cleanup and reopens the store.
//! Recovery must leave either the baseline or the complete update, never a
//! mix.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use xfstore_testkit::crash::{CrashPoint, CrashRecoveryHarness};
//!
//! let mut harness = CrashRecoveryHarness::new();
//! harness.run_all();
//! assert!(harness.all_passed());
//! ```

use crate::fixtures::{item_id, test_config, TestStore};
use xfstore_core::{CoreError, CoreResult, FaultPoint, GlobalXid, Point, TransactionManager, Xid};

const RANGE: &str = "/ts/crash";
const POINTS: &str = "/pts/crash";
const BLOB: &str = "/blob/crash";

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The transaction is still active; nothing was prepared.
    BeforePrepare,
    /// Prepare finished, the commit had not started.
    AfterPrepare,
    /// The commit record is durable, items are being merged.
    MidCommit,
    /// Every item committed, logs and journals are still present.
    AfterCommitBeforeCleanup,
    /// A distributed branch was prepared and its manager went away.
    PreparedDistributed,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [Self; 5] = [
        Self::BeforePrepare,
        Self::AfterPrepare,
        Self::MidCommit,
        Self::AfterCommitBeforeCleanup,
        Self::PreparedDistributed,
    ];

    /// Returns true if the update must survive recovery.
    pub fn update_survives(self) -> bool {
        matches!(self, Self::MidCommit | Self::AfterCommitBeforeCleanup)
    }

    fn fault(self) -> Option<FaultPoint> {
        match self {
            Self::AfterPrepare => Some(FaultPoint::AfterPrepare),
            Self::MidCommit => Some(FaultPoint::MidCommit),
            Self::AfterCommitBeforeCleanup => Some(FaultPoint::AfterCommitBeforeCleanup),
            Self::BeforePrepare | Self::PreparedDistributed => None,
        }
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// The crash point exercised.
    pub point: CrashPoint,
    /// Whether the test passed.
    pub passed: bool,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    fn pass(point: CrashPoint) -> Self {
        Self {
            point,
            passed: true,
            error: None,
        }
    }

    fn fail(point: CrashPoint, error: impl Into<String>) -> Self {
        Self {
            point,
            passed: false,
            error: Some(error.into()),
        }
    }
}

/// Test harness for crash recovery scenarios.
#[derive(Debug, Default)]
pub struct CrashRecoveryHarness {
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a new crash recovery harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every crash point.
    pub fn run_all(&mut self) {
        for point in CrashPoint::ALL {
            self.run(point);
        }
    }

    /// Runs one scenario in a fresh store and records its result.
    pub fn run(&mut self, point: CrashPoint) -> CrashRecoveryResult {
        let result = match run_scenario(point) {
            Ok(None) => CrashRecoveryResult::pass(point),
            Ok(Some(problem)) => CrashRecoveryResult::fail(point, problem),
            Err(e) => CrashRecoveryResult::fail(point, e.to_string()),
        };
        self.results.push(result.clone());
        result
    }

    /// Returns true if every recorded scenario passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Returns the failed scenarios.
    pub fn failures(&self) -> Vec<&CrashRecoveryResult> {
        self.results.iter().filter(|r| !r.passed).collect()
    }
}

fn write_update(tm: &TransactionManager, xid: &Xid) -> CoreResult<()> {
    tm.open_range(xid, &item_id(RANGE), false)?
        .write(xid, 0, b"NEW!", 2)?;
    tm.open_points(xid, &item_id(POINTS), false)?
        .write(xid, 0.0, 10.0, &[Point::new(2.0, 2.0, 2)], false)?;
    tm.open_blob(xid, &item_id(BLOB), false)?.write(xid, 2, b"new")?;
    Ok(())
}

/// Returns `Ok(None)` when the recovered state matches the crash point.
fn run_scenario(point: CrashPoint) -> CoreResult<Option<String>> {
    let mut store = TestStore::new();
    store.commit_range(RANGE, 0, b"OLD!");
    store.commit_points(POINTS, 0.0, 10.0, &[Point::new(1.0, 1.0, 1)]);
    store.commit_blob(BLOB, 1, b"old");

    store.reopen_with(test_config().fault_point(point.fault()));
    let tm = store.manager();
    match point {
        CrashPoint::BeforePrepare => {
            let xid = tm.begin()?;
            write_update(tm, &xid)?;
        }
        CrashPoint::PreparedDistributed => {
            let g = GlobalXid::new(1, *b"crash", *b"branch");
            tm.start_xa(&g, None)?;
            write_update(tm, &Xid::Global(g.clone()))?;
            tm.prepare_xa(&g).map_err(|e| match e.source {
                Some(source) => *source,
                None => CoreError::invalid_operation(e.to_string()),
            })?;
        }
        _ => {
            let xid = tm.begin()?;
            write_update(tm, &xid)?;
            match tm.commit(&xid) {
                Err(CoreError::InjectedFault { .. }) => {}
                Err(e) => return Err(e),
                Ok(()) => return Ok(Some("commit was not interrupted".to_string())),
            }
        }
    }

    store.reopen_with(test_config());
    let (range, points, blob) = if point.update_survives() {
        (&b"NEW!"[..], 2, (2, &b"new"[..]))
    } else {
        (&b"OLD!"[..], 1, (1, &b"old"[..]))
    };

    let tm = store.manager();
    let got_range = tm.read_committed_range(&item_id(RANGE), 0, 4)?.data;
    if got_range != range {
        return Ok(Some(format!("range holds {got_range:?}")));
    }
    let got_points = tm.read_committed_points(&item_id(POINTS), 0.0, 10.0)?;
    if got_points.len() != points {
        return Ok(Some(format!("{} points stored", got_points.len())));
    }
    let got_blob = tm.read_committed_blob(&item_id(BLOB))?;
    if (got_blob.originator, got_blob.data.as_slice()) != blob {
        return Ok(Some(format!("blob from originator {}", got_blob.originator)));
    }
    if point == CrashPoint::PreparedDistributed && tm.recover_xa().len() != 1 {
        return Ok(Some("distributed branch not reported".to_string()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_crash_point_recovers_consistently() {
        let mut harness = CrashRecoveryHarness::new();
        harness.run_all();
        assert_eq!(harness.results.len(), CrashPoint::ALL.len());
        assert!(harness.all_passed(), "{:?}", harness.failures());
    }

    #[test]
    fn only_commit_side_points_keep_the_update() {
        let surviving: Vec<_> = CrashPoint::ALL
            .into_iter()
            .filter(|p| p.update_survives())
            .collect();
        assert_eq!(
            surviving,
            vec![CrashPoint::MidCommit, CrashPoint::AfterCommitBeforeCleanup]
        );
    }
}
