//! # xfstore core
//!
//! The transaction engine of xfstore.
//!
//! This crate provides:
//! - Per-item locking with a transaction-exclusive, owner-reentrant level
//! - Range, point and blob items with per-transaction pending state
//! - Local two-phase commit and the XA resource-manager contract
//! - Per-transaction journals and recovery logs
//! - Startup recovery that replays or rolls back unfinished transactions
//! - A keyed fan-out router used by prepare, commit, rollback and recovery
//!
//! ## Example
//!
//! ```rust,no_run
//! use xfstore_core::{Config, TransactionManager};
//! use xfstore_storage::ItemId;
//!
//! let tm = TransactionManager::open("/tmp/xfstore".as_ref(), Config::default()).unwrap();
//! let xid = tm.begin().unwrap();
//! let id = ItemId::parse("/ts/a").unwrap();
//! let item = tm.open_range(&xid, &id, true).unwrap();
//! item.write(&xid, 0, b"ABCD", 1).unwrap();
//! tm.commit(&xid).unwrap();
//! assert_eq!(tm.read_committed_range(&id, 0, 4).unwrap().data, b"ABCD");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod dir;
mod error;
mod fault;
mod item;
mod journal;
mod lock;
mod manager;
mod opener;
mod permits;
mod pool;
mod recovery;
mod router;
mod sequence;
mod stats;
mod timer;
mod types;
mod xa;

pub use config::Config;
pub use coordinator::{PreparePolicy, TransactionInfo};
pub use dir::DataDir;
pub use error::{CoreError, CoreResult};
pub use fault::FaultPoint;
pub use item::{
    BlobContent, BlobItem, IntervalSet, ItemJournals, Mjd, OpenItem, Point, PointItem,
    RangeCaches, RangeItem, RangeMeta, RangeRead, SharedCache, TaggedIntervalSet,
    TransactionalItem,
};
pub use journal::{compute_crc32, Journal, JournalEntry, JournalIterator, JOURNAL_MAGIC, JOURNAL_VERSION};
pub use lock::{ItemLock, LockLevel, ReadGuard, WriteGuard};
pub use manager::TransactionManager;
pub use permits::{PermitPool, Permits, Throttle, UnboundedThrottle};
pub use pool::{TaskHandle, WorkerPool};
pub use recovery::{
    inspect_logs, parse_log, DeadState, LogStatus, ParsedLog, RecoveryReport, TransactionLog,
    XidStatus,
};
pub use router::{Consumer, Donatable, Router, RouterSummary, RoutingKey, WorkSource};
pub use sequence::PersistentSequence;
pub use stats::{EngineStats, StatsSnapshot};
pub use timer::{AutoRollback, RollbackScheduler, RollbackTarget};
pub use types::{GlobalXid, ItemKey, ItemKind, Xid};
pub use xa::{XaError, XaOutcome, XaResult, XaVote};
