//! River transactions: a two-phase commit coordinator driving participants
//! through voting and completion, with leased transactions and a durable
//! decision log.

mod manager;
mod participant;
mod state;

use std::error;
use std::fmt;

use crate::lease::LeaseError;
use crate::utils::{RiverError, Uid};

use serde::{Deserialize, Serialize};

pub use manager::{CompletionReport, Created, TxnConfig, TxnManager, TxnRecord};
pub use participant::{Participant, RemoteParticipant};
pub use state::{tally, TxnState, Vote};

/// Transaction-level error.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum TxnError {
    /// The transaction id is not (or no longer) known to the manager.
    UnknownTransaction(Uid),

    /// A join was refused.
    CannotJoin(String),

    /// Commit could not be carried out; the transaction is aborted or is
    /// already being completed.
    CannotCommit(String),

    /// Abort could not be carried out, e.g. the transaction committed.
    CannotAbort(String),

    /// The transaction's lease could not be created.
    Lease(LeaseError),

    /// The decision log failed.
    Storage(String),

    /// Communication failure.
    Remote(String),
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxnError::UnknownTransaction(id) => {
                write!(f, "unknown transaction {}", id)
            }
            TxnError::CannotJoin(msg) => write!(f, "cannot join: {}", msg),
            TxnError::CannotCommit(msg) => write!(f, "cannot commit: {}", msg),
            TxnError::CannotAbort(msg) => write!(f, "cannot abort: {}", msg),
            TxnError::Lease(e) => write!(f, "transaction lease: {}", e),
            TxnError::Storage(msg) => write!(f, "log failure: {}", msg),
            TxnError::Remote(msg) => write!(f, "remote failure: {}", msg),
        }
    }
}

impl error::Error for TxnError {}

impl TxnError {
    pub(crate) fn storage(e: RiverError) -> Self {
        TxnError::Storage(e.to_string())
    }
}

impl From<LeaseError> for TxnError {
    fn from(e: LeaseError) -> Self {
        TxnError::Lease(e)
    }
}

impl From<RiverError> for TxnError {
    fn from(e: RiverError) -> Self {
        TxnError::Remote(e.to_string())
    }
}
