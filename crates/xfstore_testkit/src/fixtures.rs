//! Test fixtures and store helpers.
//!
//! Provides a temporary store that can be crashed and reopened, plus
//! shorthand for the common one-item transactions.

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use xfstore_core::{BlobContent, Config, Point, TransactionManager};
use xfstore_storage::ItemId;

/// Configuration used by test stores: short lock waits and no fsync.
pub fn test_config() -> Config {
    Config::new()
        .lock_timeout(Duration::from_secs(5))
        .sync_on_commit(false)
        .sync_on_recovery(false)
}

/// Parses an item identifier, panicking on invalid input.
pub fn item_id(text: &str) -> ItemId {
    ItemId::parse(text).expect("Invalid item id")
}

/// A store in a temporary directory with automatic cleanup.
pub struct TestStore {
    manager: Option<TransactionManager>,
    config: Config,
    temp_dir: TempDir,
}

impl TestStore {
    /// Creates a store with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a store with a custom configuration.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let manager = TransactionManager::open(temp_dir.path(), config.clone())
            .expect("Failed to open store");
        Self {
            manager: Some(manager),
            config,
            temp_dir,
        }
    }

    /// Returns the data directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Returns the open manager.
    pub fn manager(&self) -> &TransactionManager {
        self.manager.as_ref().expect("Store is not open")
    }

    /// Drops the manager without closing it, as a process crash would.
    pub fn crash(&mut self) {
        self.manager = None;
    }

    /// Crashes the store and opens it again with the same configuration,
    /// running recovery.
    pub fn reopen(&mut self) {
        let config = self.config.clone();
        self.reopen_with(config);
    }

    /// Crashes the store and opens it again with another configuration.
    pub fn reopen_with(&mut self, config: Config) {
        self.crash();
        let manager =
            TransactionManager::open(self.temp_dir.path(), config.clone()).expect("Failed to reopen store");
        self.manager = Some(manager);
        self.config = config;
    }

    /// Writes bytes to a range item in its own committed transaction.
    pub fn commit_range(&self, id: &str, start: i64, bytes: &[u8]) {
        let tm = self.manager();
        let xid = tm.begin().expect("Failed to begin");
        tm.open_range(&xid, &item_id(id), true)
            .expect("Failed to open range item")
            .write(&xid, start, bytes, 1)
            .expect("Failed to write range");
        tm.commit(&xid).expect("Failed to commit");
    }

    /// Reads committed bytes of a range item.
    pub fn committed_range(&self, id: &str, start: i64, len: usize) -> Vec<u8> {
        self.manager()
            .read_committed_range(&item_id(id), start, len)
            .expect("Failed to read range")
            .data
    }

    /// Stores points in their own committed transaction.
    pub fn commit_points(&self, id: &str, start: f64, end: f64, points: &[Point]) {
        let tm = self.manager();
        let xid = tm.begin().expect("Failed to begin");
        tm.open_points(&xid, &item_id(id), true)
            .expect("Failed to open points item")
            .write(&xid, start, end, points, false)
            .expect("Failed to write points");
        tm.commit(&xid).expect("Failed to commit");
    }

    /// Reads committed points of an item.
    pub fn committed_points(&self, id: &str, start: f64, end: f64) -> Vec<Point> {
        self.manager()
            .read_committed_points(&item_id(id), start, end)
            .expect("Failed to read points")
    }

    /// Replaces a blob in its own committed transaction.
    pub fn commit_blob(&self, id: &str, originator: i64, data: &[u8]) {
        let tm = self.manager();
        let xid = tm.begin().expect("Failed to begin");
        tm.open_blob(&xid, &item_id(id), true)
            .expect("Failed to open blob item")
            .write(&xid, originator, data)
            .expect("Failed to write blob");
        tm.commit(&xid).expect("Failed to commit");
    }

    /// Reads a committed blob, or `None` if it does not exist.
    pub fn committed_blob(&self, id: &str) -> Option<BlobContent> {
        match self.manager().read_committed_blob(&item_id(id)) {
            Ok(content) => Some(content),
            Err(e) if e.is_not_found() => None,
            Err(e) => panic!("Failed to read blob: {e}"),
        }
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStore {
    type Target = TransactionManager;

    fn deref(&self) -> &Self::Target {
        self.manager()
    }
}

/// Runs a test with a temporary store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&TransactionManager) -> R,
{
    let store = TestStore::new();
    f(store.manager())
}
