//! Unique identifiers for leases, transactions, and participants.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque unique identifier. Only equality and hashing are meaningful to
/// holders.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize, Deserialize,
)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Counter-based identifier source. Constructed once per service and shared
/// by reference. Recovery replays call `mark_in_use()` for every identifier
/// found in the log so later allocations never collide with them.
#[derive(Debug)]
pub struct UidGenerator {
    next: AtomicU64,
}

impl UidGenerator {
    /// Creates a generator whose first identifier is 1.
    pub fn new() -> Self {
        UidGenerator {
            next: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh identifier.
    pub fn generate(&self) -> Uid {
        Uid(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Records that `uid` has been issued before.
    pub fn mark_in_use(&self, uid: Uid) {
        self.next.fetch_max(uid.0.saturating_add(1), Ordering::SeqCst);
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new()
    }
}
