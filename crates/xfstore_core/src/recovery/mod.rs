//! Recovery logs, journal merging and startup recovery.

mod consumer;
mod log;
mod startup;

pub(crate) use consumer::{journal_source, JournalMerger, MergeMode};
pub(crate) use log::log_path;
pub use log::{parse_log, DeadState, LogStatus, ParsedLog, TransactionLog};
pub(crate) use startup::{Recovered, RecoveryBootstrap};
pub use startup::{inspect_logs, RecoveryReport, XidStatus};
