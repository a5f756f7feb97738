//! Concurrency stress runners.
//!
//! Several threads drive many short transactions against a shared manager.
//! Each run reports how the transactions ended.

use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use xfstore_core::{CoreResult, TransactionManager};
use xfstore_storage::ItemId;

/// How the transactions of one stress run ended.
#[derive(Debug, Clone, Default)]
pub struct StressOutcome {
    /// Transactions that committed, or reads that succeeded.
    pub committed: usize,
    /// Transactions rolled back on purpose.
    pub rolled_back: usize,
    /// Transactions or reads that returned an error.
    pub failed: usize,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl StressOutcome {
    /// Returns every transaction or read attempted.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.committed + self.rolled_back + self.failed
    }

    /// Returns attempts per second, or zero for an instant run.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.attempts() as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for StressOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} committed, {} rolled back, {} failed in {:?} ({:.0}/s)",
            self.committed,
            self.rolled_back,
            self.failed,
            self.elapsed,
            self.throughput()
        )
    }
}

#[derive(Default)]
struct Tally {
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn count(&self, ended: CoreResult<bool>) {
        let slot = match ended {
            Ok(true) => &self.committed,
            Ok(false) => &self.rolled_back,
            Err(_) => &self.failed,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(self, started: Instant) -> StressOutcome {
        StressOutcome {
            committed: self.committed.into_inner(),
            rolled_back: self.rolled_back.into_inner(),
            failed: self.failed.into_inner(),
            elapsed: started.elapsed(),
        }
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Transactions per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Bytes written per transaction.
    pub write_size: usize,
    /// Number of distinct range items.
    pub item_count: usize,
    /// Share of transactions rolled back instead of committed, in percent.
    pub rollback_percent: u32,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            write_size: 64,
            item_count: 8,
            rollback_percent: 20,
        }
    }
}

fn stress_item(index: usize) -> CoreResult<ItemId> {
    Ok(ItemId::new("/stress", &format!("item{index}"))?)
}

/// One transaction writing a random slot of a random item. Returns whether
/// it committed.
fn write_once<R: Rng>(
    tm: &TransactionManager,
    config: &StressConfig,
    writer: usize,
    rng: &mut R,
) -> CoreResult<bool> {
    let id = stress_item(rng.gen_range(0..config.item_count.max(1)))?;
    let slot = rng.gen_range(0..16i64);
    let bytes = vec![writer as u8; config.write_size];

    let xid = tm.begin()?;
    let item = tm.open_range(&xid, &id, true)?;
    if let Err(e) = item.write(&xid, slot * config.write_size as i64, &bytes, writer as i64) {
        tm.rollback(&xid)?;
        return Err(e);
    }
    if rng.gen_range(0..100) < config.rollback_percent {
        tm.rollback(&xid)?;
        Ok(false)
    } else {
        tm.commit(&xid)?;
        Ok(true)
    }
}

/// Commits one byte to every stress item so writers never race to create.
fn seed_items(tm: &TransactionManager, config: &StressConfig) {
    for index in 0..config.item_count {
        let Ok(id) = stress_item(index) else { continue };
        let Ok(xid) = tm.begin() else { continue };
        let seeded = tm
            .open_range(&xid, &id, true)
            .and_then(|item| item.write(&xid, 0, &[0], 0))
            .and_then(|()| tm.commit(&xid));
        if seeded.is_err() {
            let _ = tm.rollback(&xid);
        }
    }
}

/// Runs concurrent single-item write transactions.
pub fn stress_concurrent_writes(tm: &TransactionManager, config: &StressConfig) -> StressOutcome {
    seed_items(tm, config);
    let tally = Tally::default();
    let started = Instant::now();

    thread::scope(|scope| {
        for writer in 0..config.threads {
            let tally = &tally;
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..config.operations {
                    tally.count(write_once(tm, config, writer, &mut rng));
                }
            });
        }
    });
    tally.finish(started)
}

/// Runs committed-view reads while one writer commits to the same items.
///
/// Only the reads are counted.
pub fn stress_reads_during_writes(tm: &TransactionManager, config: &StressConfig) -> StressOutcome {
    seed_items(tm, config);
    let tally = Tally::default();
    let started = Instant::now();

    thread::scope(|scope| {
        scope.spawn(|| {
            let mut rng = rand::thread_rng();
            for _ in 0..config.operations {
                let _ = write_once(tm, config, 0, &mut rng);
            }
        });
        for _ in 0..config.threads {
            let tally = &tally;
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..config.operations {
                    let read = stress_item(rng.gen_range(0..config.item_count.max(1)))
                        .and_then(|id| tm.read_committed_range(&id, 0, config.write_size));
                    tally.count(read.map(|_| true));
                }
            });
        }
    });
    tally.finish(started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;

    fn small() -> StressConfig {
        StressConfig {
            operations: 25,
            threads: 3,
            write_size: 16,
            item_count: 4,
            rollback_percent: 30,
        }
    }

    #[test]
    fn concurrent_writes_all_finish() {
        let mut store = TestStore::new();
        let result = stress_concurrent_writes(store.manager(), &small());
        assert_eq!(result.attempts(), 75);
        assert_eq!(result.failed, 0, "{result}");
        assert!(store.transactions().is_empty());

        store.reopen();
        assert!(store.recovery_report().replayed.is_empty());
        assert!(store.recovery_report().rolled_back.is_empty());
    }

    #[test]
    fn committed_reads_never_fail_during_writes() {
        let store = TestStore::new();
        let result = stress_reads_during_writes(store.manager(), &small());
        assert_eq!(result.failed, 0, "{result}");
        assert_eq!(result.committed, 75);
        assert_eq!(result.rolled_back, 0);
    }
}
