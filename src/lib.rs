//! River: leased resources with background renewal, and a two-phase commit
//! transaction coordinator.
//!
//! The `lease` module holds the landlord protocol, client lease handles,
//! batch lease maps, and the renewal manager. The `txn` module holds the
//! participant protocol and the transaction manager, whose transactions are
//! themselves leased.

#[macro_use]
mod utils;

mod remote;
mod storage;

pub mod lease;
pub mod txn;

pub use utils::{
    logger_init, Clock, ManualClock, RiverError, SystemClock, Uid, UidGenerator,
    ME,
};
