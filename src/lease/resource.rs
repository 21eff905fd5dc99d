//! Leased resource record held by a landlord.

use crate::utils::Uid;

/// A granted resource keyed by its cookie. Values are immutable: renewal
/// produces a new value that the owning table swaps in for the old one, so a
/// concurrent reader only ever sees a whole record.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LeasedResource<R> {
    cookie: Uid,
    expiration: i64,
    resource: R,
}

impl<R: Clone> LeasedResource<R> {
    pub fn new(cookie: Uid, expiration: i64, resource: R) -> Self {
        LeasedResource {
            cookie,
            expiration,
            resource,
        }
    }

    pub fn cookie(&self) -> Uid {
        self.cookie
    }

    pub fn expiration(&self) -> i64 {
        self.expiration
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// True if the grant has run out at time `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration <= now
    }

    /// Returns a copy with the given expiration; the receiver is unchanged.
    pub fn renew(&self, expiration: i64) -> Self {
        LeasedResource {
            expiration,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod resource_tests {
    use super::*;
    use crate::lease::FOREVER;

    #[test]
    fn renew_copies() {
        let res = LeasedResource::new(Uid(9), 1000, "space".to_string());
        let renewed = res.renew(5000);
        assert_eq!(res.expiration(), 1000);
        assert_eq!(renewed.expiration(), 5000);
        assert_eq!(renewed.cookie(), Uid(9));
        assert_eq!(renewed.resource(), "space");
    }

    #[test]
    fn expiry_check() {
        let res = LeasedResource::new(Uid(1), 1000, ());
        assert!(!res.is_expired(999));
        assert!(res.is_expired(1000));
        assert!(!res.renew(FOREVER).is_expired(i64::MAX - 1));
    }
}
