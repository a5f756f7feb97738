//! Error types for the transaction engine.

use crate::fault::FaultPoint;
use crate::lock::LockLevel;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in transaction engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend or allocator error.
    #[error("storage error: {0}")]
    Storage(#[from] xfstore_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A lock could not be acquired within the configured window.
    #[error(
        "timed out after {waited:?} acquiring {level} lock on {resource} for {requester}; \
         owner: {}, queue length: {queue_length}",
        owner.as_deref().unwrap_or("none")
    )]
    LockTimeout {
        /// The item or transaction the lock protects.
        resource: String,
        /// Which lock was requested.
        level: LockLevel,
        /// The transaction that asked for the lock.
        requester: String,
        /// Current owner: a transaction id or a thread name.
        owner: Option<String>,
        /// Number of waiters queued on the lock, including the requester.
        queue_length: usize,
        /// How long the requester waited.
        waited: Duration,
    },

    /// The transaction is unknown or already finalized.
    #[error("transaction not found: {xid}")]
    TransactionNotFound {
        /// The transaction identifier.
        xid: String,
    },

    /// The item does not exist, or was deleted in the caller's view.
    #[error("item not found: {item}")]
    ItemNotFound {
        /// The item identifier.
        item: String,
    },

    /// The item is not enrolled in the transaction.
    #[error("item {item} is not enrolled in transaction {xid}")]
    NotEnrolled {
        /// The item identifier.
        item: String,
        /// The transaction identifier.
        xid: String,
    },

    /// The transaction no longer accepts new items.
    #[error("transaction {xid} no longer accepts new items")]
    EnrollmentClosed {
        /// The transaction identifier.
        xid: String,
    },

    /// A journal is malformed.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Item metadata or content is malformed.
    #[error("storage corruption: {message}")]
    StorageCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A blocked wait was cancelled.
    #[error("interrupted: {message}")]
    Interrupted {
        /// What was interrupted.
        message: String,
    },

    /// Startup recovery found a log it cannot resolve and changed nothing.
    #[error("recovery aborted: {message}")]
    RecoveryAborted {
        /// Which log failed and why.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Another engine holds the data directory.
    #[error("data directory locked: another process has exclusive access")]
    DataDirLocked,

    /// A configured fault point was reached.
    #[error("injected fault at {point:?}")]
    InjectedFault {
        /// The fault point.
        point: FaultPoint,
    },
}

impl CoreError {
    /// Creates a transaction-not-found error.
    pub fn transaction_not_found(xid: impl ToString) -> Self {
        Self::TransactionNotFound {
            xid: xid.to_string(),
        }
    }

    /// Creates an item-not-found error.
    pub fn item_not_found(item: impl ToString) -> Self {
        Self::ItemNotFound {
            item: item.to_string(),
        }
    }

    /// Creates a not-enrolled error.
    pub fn not_enrolled(item: impl ToString, xid: impl ToString) -> Self {
        Self::NotEnrolled {
            item: item.to_string(),
            xid: xid.to_string(),
        }
    }

    /// Creates an enrollment-closed error.
    pub fn enrollment_closed(xid: impl ToString) -> Self {
        Self::EnrollmentClosed {
            xid: xid.to_string(),
        }
    }

    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a storage corruption error.
    pub fn storage_corruption(message: impl Into<String>) -> Self {
        Self::StorageCorruption {
            message: message.into(),
        }
    }

    /// Creates an interruption error.
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted {
            message: message.into(),
        }
    }

    /// Creates a recovery aborted error.
    pub fn recovery_aborted(message: impl Into<String>) -> Self {
        Self::RecoveryAborted {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for lock acquisition timeouts.
    #[must_use]
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Returns true when the item does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ItemNotFound { .. })
    }

    /// Returns true for I/O and storage failures.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }
}
