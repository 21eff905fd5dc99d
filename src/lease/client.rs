//! Client-visible lease handle.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::lease::{
    expiration_after, valid_request, Grant, LandlordRef, LeaseError, LeaseMap,
};
use crate::utils::{Clock, RiverError, Uid};

/// A client's handle on a granted resource: the cookie, the expiration as
/// seen on the client's clock, and the landlord that issued it.
///
/// Equality and hashing use the (landlord, cookie) pair only.
#[derive(Clone)]
pub struct Lease {
    cookie: Uid,
    expiration: i64,
    landlord: LandlordRef,
    batchable: bool,
    clock: Arc<dyn Clock>,
}

impl Lease {
    pub fn new(
        cookie: Uid,
        expiration: i64,
        landlord: LandlordRef,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Lease {
            cookie,
            expiration,
            landlord,
            batchable: true,
            clock,
        }
    }

    /// Builds the handle for a fresh grant; the expiration is recomputed on
    /// the client's clock from the granted duration.
    pub fn from_grant(
        grant: &Grant,
        landlord: LandlordRef,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let expiration = expiration_after(clock.now_ms(), grant.duration);
        Self::new(grant.cookie, expiration, landlord, clock)
    }

    pub fn cookie(&self) -> Uid {
        self.cookie
    }

    pub fn expiration(&self) -> i64 {
        self.expiration
    }

    pub fn landlord(&self) -> &LandlordRef {
        &self.landlord
    }

    /// Key identifying this lease across landlords.
    pub(crate) fn key(&self) -> (Uid, Uid) {
        (self.landlord.id(), self.cookie)
    }

    pub(crate) fn set_expiration(&mut self, expiration: i64) {
        self.expiration = expiration;
    }

    pub fn is_batchable(&self) -> bool {
        self.batchable
    }

    /// Opts this lease in or out of batched landlord calls.
    pub fn set_batchable(&mut self, batchable: bool) {
        self.batchable = batchable;
    }

    /// True if both leases may be renewed or cancelled in one landlord call.
    pub fn can_batch_with(&self, other: &Lease) -> bool {
        self.batchable && other.batchable && self.landlord.same_as(&other.landlord)
    }

    /// Renews for `duration` ms, updating the local expiration on success.
    pub async fn renew(&mut self, duration: i64) -> Result<(), LeaseError> {
        if !valid_request(duration) {
            return Err(LeaseError::Denied(format!(
                "invalid duration {}",
                duration
            )));
        }
        let now = self.clock.now_ms();
        let granted = self.landlord.remote().renew(self.cookie, duration).await?;
        self.expiration = expiration_after(now, granted);
        Ok(())
    }

    /// Cancels at the landlord.
    pub async fn cancel(&self) -> Result<(), LeaseError> {
        self.landlord.remote().cancel(self.cookie).await
    }

    /// Creates a batch map holding this lease with the given duration.
    pub fn create_lease_map(&self, duration: i64) -> Result<LeaseMap, RiverError> {
        let mut map = LeaseMap::new(self.landlord.clone(), self.clock.clone());
        map.insert(self.clone(), duration)?;
        Ok(map)
    }
}

impl PartialEq for Lease {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Lease {}

impl Hash for Lease {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Lease")
            .field("cookie", &self.cookie)
            .field("expiration", &self.expiration)
            .field("landlord", &self.landlord)
            .field("batchable", &self.batchable)
            .finish()
    }
}
