//! Engine configuration.

use crate::fault::FaultPoint;
use std::time::Duration;

/// Configuration for opening a transaction engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the data directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Bound on every item and coordinator lock acquisition.
    pub lock_timeout: Duration,

    /// Default idle time before a transaction is rolled back automatically.
    pub auto_rollback_timeout: Duration,

    /// Size of the shared permit pool for prepare/commit/rollback fan-out.
    pub max_concurrent_workers: usize,

    /// Cap on the client worker pool of a single transaction.
    pub max_client_threads_per_transaction: usize,

    /// Bound of each router consumer queue.
    pub router_queue_length: usize,

    /// Whether to fsync journals and allocator indexes at commit.
    pub sync_on_commit: bool,

    /// Whether to fsync after recovery repairs the store.
    pub sync_on_recovery: bool,

    /// Entries in the range-item metadata cache.
    pub metadata_cache_capacity: usize,

    /// Entries in the pending-operation cache.
    pub operation_cache_capacity: usize,

    #[doc(hidden)]
    pub fault_point: Option<FaultPoint>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            lock_timeout: Duration::from_secs(60),
            auto_rollback_timeout: Duration::from_secs(3600),
            max_concurrent_workers: 32,
            max_client_threads_per_transaction: 8,
            router_queue_length: 512,
            sync_on_commit: true,
            sync_on_recovery: true,
            metadata_cache_capacity: 4096,
            operation_cache_capacity: 16384,
            fault_point: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the lock acquisition timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the default auto-rollback idle timeout.
    #[must_use]
    pub const fn auto_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.auto_rollback_timeout = timeout;
        self
    }

    /// Sets the size of the shared permit pool.
    #[must_use]
    pub const fn max_concurrent_workers(mut self, workers: usize) -> Self {
        self.max_concurrent_workers = workers;
        self
    }

    /// Sets the per-transaction client thread cap.
    #[must_use]
    pub const fn max_client_threads_per_transaction(mut self, threads: usize) -> Self {
        self.max_client_threads_per_transaction = threads;
        self
    }

    /// Sets the router queue bound.
    #[must_use]
    pub const fn router_queue_length(mut self, length: usize) -> Self {
        self.router_queue_length = length;
        self
    }

    /// Sets whether to sync at commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether to sync after recovery.
    #[must_use]
    pub const fn sync_on_recovery(mut self, value: bool) -> Self {
        self.sync_on_recovery = value;
        self
    }

    /// Sets the metadata cache capacity.
    #[must_use]
    pub const fn metadata_cache_capacity(mut self, entries: usize) -> Self {
        self.metadata_cache_capacity = entries;
        self
    }

    /// Sets the pending-operation cache capacity.
    #[must_use]
    pub const fn operation_cache_capacity(mut self, entries: usize) -> Self {
        self.operation_cache_capacity = entries;
        self
    }

    #[doc(hidden)]
    #[must_use]
    pub const fn fault_point(mut self, point: Option<FaultPoint>) -> Self {
        self.fault_point = point;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.lock_timeout, Duration::from_secs(60));
        assert_eq!(config.auto_rollback_timeout, Duration::from_secs(3600));
        assert!(config.fault_point.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .lock_timeout(Duration::from_millis(250))
            .max_concurrent_workers(4)
            .sync_on_recovery(false);

        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.max_concurrent_workers, 4);
        assert!(!config.sync_on_recovery);
    }
}
