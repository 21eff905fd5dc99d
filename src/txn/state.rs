//! Transaction states, participant votes, and vote aggregation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coordinator-side transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Open; participants may still join.
    Active,

    /// Participants are being asked to prepare.
    Voting,

    /// At least one participant has state to commit.
    Prepared,

    /// No participant had anything to commit.
    NotChanged,

    Committed,

    Aborted,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }

    /// True if `next` directly follows this state.
    pub fn can_transition_to(self, next: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (self, next),
            (Active, Voting)
                | (Active, Aborted)
                | (Voting, Prepared)
                | (Voting, NotChanged)
                | (Voting, Aborted)
                | (Prepared, Committed)
                | (NotChanged, Committed)
        )
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TxnState::Active => "ACTIVE",
            TxnState::Voting => "VOTING",
            TxnState::Prepared => "PREPARED",
            TxnState::NotChanged => "NOTCHANGED",
            TxnState::Committed => "COMMITTED",
            TxnState::Aborted => "ABORTED",
        };
        write!(f, "{}", name)
    }
}

/// A participant's answer to prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    Prepared,
    NotChanged,
    Aborted,
}

/// Aggregates votes into the outcome of the voting phase: any abort wins,
/// else any prepared vote makes the transaction PREPARED, else NOTCHANGED.
/// No votes at all is NOTCHANGED.
pub fn tally(votes: impl IntoIterator<Item = Vote>) -> TxnState {
    let mut outcome = TxnState::NotChanged;
    for vote in votes {
        match vote {
            Vote::Aborted => return TxnState::Aborted,
            Vote::Prepared => outcome = TxnState::Prepared,
            Vote::NotChanged => {}
        }
    }
    outcome
}
