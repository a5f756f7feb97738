//! Distributed transaction (XA) outcomes.
//!
//! The resource-manager contract reports failures as one of a fixed set of
//! outcomes. [`XaOutcome::code`] gives the standard X/Open return code for
//! callers that bridge to a transaction manager speaking integer codes.

use crate::error::CoreError;
use std::fmt;
use thiserror::Error;

/// Result type for distributed transaction operations.
pub type XaResult<T> = Result<T, XaError>;

/// Outcome reported by a failed distributed transaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaOutcome {
    /// The branch was rolled back because of a lock conflict.
    Deadlock,
    /// The branch was rolled back heuristically.
    HeuristicRollback,
    /// The branch was committed heuristically.
    HeuristicCommit,
    /// Part of the branch committed and part rolled back.
    HeuristicMixed,
    /// The branch may have been partly committed.
    HeuristicHazard,
    /// Storage or I/O failed while processing the branch.
    CommunicationFailure,
    /// The branch was rolled back for an unspecified reason.
    Other,
    /// The transaction id is not known to this resource manager.
    UnknownTransaction,
    /// An internal resource manager error.
    ResourceManagerError,
}

impl XaOutcome {
    /// Returns the X/Open return code of this outcome.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::CommunicationFailure => 101,
            Self::Deadlock => 102,
            Self::Other => 104,
            Self::HeuristicHazard => 8,
            Self::HeuristicCommit => 7,
            Self::HeuristicRollback => 6,
            Self::HeuristicMixed => 5,
            Self::ResourceManagerError => -3,
            Self::UnknownTransaction => -4,
        }
    }

    /// Returns true when the branch is known to be rolled back.
    #[must_use]
    pub const fn is_rollback(self) -> bool {
        matches!(
            self,
            Self::Deadlock | Self::CommunicationFailure | Self::Other
        )
    }

    /// Classifies a prepare-time failure.
    #[must_use]
    pub fn for_prepare_failure(error: &CoreError) -> Self {
        if error.is_lock_timeout() {
            Self::Deadlock
        } else if error.is_io() {
            Self::CommunicationFailure
        } else if matches!(error, CoreError::TransactionNotFound { .. }) {
            Self::UnknownTransaction
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for XaOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deadlock => "XA_RBDEADLOCK",
            Self::HeuristicRollback => "XA_HEURRB",
            Self::HeuristicCommit => "XA_HEURCOM",
            Self::HeuristicMixed => "XA_HEURMIX",
            Self::HeuristicHazard => "XA_HEURHAZ",
            Self::CommunicationFailure => "XA_RBCOMMFAIL",
            Self::Other => "XA_RBOTHER",
            Self::UnknownTransaction => "XAER_NOTA",
            Self::ResourceManagerError => "XAER_RMERR",
        };
        f.write_str(name)
    }
}

/// A failed distributed transaction operation.
#[derive(Debug, Error)]
#[error("{outcome}: {message}")]
pub struct XaError {
    /// The protocol outcome.
    pub outcome: XaOutcome,
    /// Human-readable context.
    pub message: String,
    /// The engine error behind the outcome, if any.
    #[source]
    pub source: Option<Box<CoreError>>,
}

impl XaError {
    /// Creates an outcome without an underlying engine error.
    pub fn new(outcome: XaOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an engine error with an outcome.
    #[must_use]
    pub fn with_source(outcome: XaOutcome, source: CoreError) -> Self {
        Self {
            outcome,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an unknown-transaction error.
    pub fn unknown(xid: impl fmt::Display) -> Self {
        Self::new(
            XaOutcome::UnknownTransaction,
            format!("unknown transaction {xid}"),
        )
    }
}

impl From<CoreError> for XaError {
    fn from(error: CoreError) -> Self {
        let outcome = match error {
            CoreError::TransactionNotFound { .. } => XaOutcome::UnknownTransaction,
            _ => XaOutcome::ResourceManagerError,
        };
        Self::with_source(outcome, error)
    }
}

/// Vote returned by a successful distributed prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaVote {
    /// The branch has changes and is ready to commit.
    Ok,
    /// The branch made no changes and is already complete.
    ReadOnly,
}
