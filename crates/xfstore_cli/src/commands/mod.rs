//! CLI command implementations.

pub mod in_doubt;
pub mod logs;
pub mod recover;

use std::path::Path;
use tracing::debug;
use xfstore_core::{Config, CoreResult, TransactionManager};

/// Opens an existing data directory. Opening runs startup recovery.
fn open_existing(path: &Path, sync: bool) -> CoreResult<TransactionManager> {
    debug!(path = %path.display(), sync, "opening data directory");
    let config = Config::new()
        .create_if_missing(false)
        .sync_on_recovery(sync);
    TransactionManager::open(path, config)
}
