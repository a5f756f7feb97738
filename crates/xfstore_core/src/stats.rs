//! Engine statistics.
//!
//! Counters are atomic and can be read while transactions are running.
//!
//! ```rust,ignore
//! let stats = manager.stats();
//! println!("committed: {}", stats.committed);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Live engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    auto_rollbacks: AtomicU64,
    recovered: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_begin(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auto_rollback(&self) {
        self.auto_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovered(&self, count: u64) {
        self.recovered.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            auto_rollbacks: self.auto_rollbacks.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Transactions begun (local and distributed).
    pub begun: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions rolled back, including automatic rollbacks.
    pub rolled_back: u64,
    /// Transactions rolled back by the idle timer.
    pub auto_rollbacks: u64,
    /// Transactions resolved by startup recovery.
    pub recovered: u64,
    /// Lock acquisitions that timed out.
    pub lock_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = EngineStats::new();
        stats.record_begin();
        stats.record_begin();
        stats.record_commit();
        stats.record_rollback();
        stats.record_auto_rollback();
        stats.record_recovered(3);

        let snap = stats.snapshot();
        assert_eq!(snap.begun, 2);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.rolled_back, 1);
        assert_eq!(snap.auto_rollbacks, 1);
        assert_eq!(snap.recovered, 3);
        assert_eq!(snap.lock_timeouts, 0);
    }
}
