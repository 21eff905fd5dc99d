//! River leasing: server-side landlords granting time-bounded resources, and
//! client-side lease handles, batch maps, and the background renewal manager.

mod client;
mod landlord;
mod map;
mod policy;
mod remote;
mod renewal;
mod resource;

use std::error;
use std::fmt;

use crate::utils::{RiverError, Uid};

use serde::{Deserialize, Serialize};

pub use client::Lease;
pub use landlord::{Grant, Landlord, LandlordRef, RenewResults, ResourceLandlord};
pub use map::{LeaseMap, LeaseMapError};
pub use policy::LeasePolicy;
pub use remote::RemoteLandlord;
pub use renewal::{
    LeaseListener, LeaseRenewalEvent, LeaseRenewalManager, RenewalConfig,
};
pub use resource::LeasedResource;

/// Duration and expiration sentinel meaning "never expires". It is carried
/// through the protocol untouched, never added to or clamped.
pub const FOREVER: i64 = i64::MAX;

/// Requested duration meaning "grantor's choice".
pub const ANY: i64 = -1;

/// Absolute expiration reached after holding for `duration` ms from `now`.
pub fn expiration_after(now: i64, duration: i64) -> i64 {
    if duration == FOREVER {
        FOREVER
    } else {
        now.saturating_add(duration)
    }
}

/// Checks that a requested duration is either a non-negative number of ms or
/// one of the sentinels.
pub fn valid_request(duration: i64) -> bool {
    duration >= 0 || duration == ANY
}

/// Per-lease failure kinds. A batch never aggregates these into one
/// all-or-nothing failure.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum LeaseError {
    /// Cookie not recognized: never issued, cancelled, or expired and reaped.
    UnknownLease(Uid),

    /// Grantor refused the specific request.
    Denied(String),

    /// Could not reach the grantor, or the call timed out.
    Remote(String),
}

impl LeaseError {
    pub fn is_unknown(&self) -> bool {
        matches!(self, LeaseError::UnknownLease(_))
    }
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LeaseError::UnknownLease(cookie) => {
                write!(f, "unknown lease {}", cookie)
            }
            LeaseError::Denied(reason) => write!(f, "lease denied: {}", reason),
            LeaseError::Remote(reason) => {
                write!(f, "remote call failed: {}", reason)
            }
        }
    }
}

impl error::Error for LeaseError {}

impl From<RiverError> for LeaseError {
    fn from(e: RiverError) -> Self {
        LeaseError::Remote(e.to_string())
    }
}

#[cfg(test)]
mod lease_tests {
    use super::*;

    #[test]
    fn forever_untouched() {
        assert_eq!(expiration_after(1000, FOREVER), FOREVER);
        assert_eq!(expiration_after(FOREVER - 5, 10), FOREVER);
        assert_eq!(expiration_after(1000, 250), 1250);
    }

    #[test]
    fn request_validity() {
        assert!(valid_request(0));
        assert!(valid_request(ANY));
        assert!(valid_request(FOREVER));
        assert!(!valid_request(-2));
    }

    #[test]
    fn remote_from_river_error() {
        let e: LeaseError = RiverError::msg("channel closed").into();
        assert_eq!(e, LeaseError::Remote("channel closed".into()));
        assert!(!e.is_unknown());
    }
}
