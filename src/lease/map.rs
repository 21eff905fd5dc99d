//! Client-side batching of renew/cancel calls against one landlord.

use std::collections::hash_map;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::Arc;

use crate::lease::{
    expiration_after, valid_request, LandlordRef, Lease, LeaseError,
};
use crate::utils::{Clock, RiverError, Uid};

/// Map from lease to requested renewal duration, for leases that all share
/// one landlord. Batch calls drop failed entries from the map before
/// reporting them, so a retry only covers the survivors.
pub struct LeaseMap {
    landlord: LandlordRef,
    clock: Arc<dyn Clock>,

    /// Map from cookie -> (current lease value, requested duration).
    entries: HashMap<Uid, (Lease, i64)>,
}

/// Partial failure of a batch call: the leases removed from the map, each
/// with the error that removed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseMapError {
    failures: HashMap<Uid, (Lease, LeaseError)>,
}

impl LeaseMapError {
    pub fn failures(&self) -> &HashMap<Uid, (Lease, LeaseError)> {
        &self.failures
    }

    pub fn into_failures(self) -> HashMap<Uid, (Lease, LeaseError)> {
        self.failures
    }

    /// Error that removed the given lease, if any.
    pub fn get(&self, lease: &Lease) -> Option<&LeaseError> {
        self.failures
            .get(&lease.cookie())
            .filter(|(l, _)| l == lease)
            .map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for LeaseMapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} lease(s) failed in batch", self.failures.len())
    }
}

impl error::Error for LeaseMapError {}

impl LeaseMap {
    pub fn new(landlord: LandlordRef, clock: Arc<dyn Clock>) -> Self {
        LeaseMap {
            landlord,
            clock,
            entries: HashMap::new(),
        }
    }

    /// True if the lease may be batched with the others in this map.
    pub fn can_contain_key(&self, lease: &Lease) -> bool {
        lease.is_batchable() && lease.landlord().same_as(&self.landlord)
    }

    /// Inserts or replaces a lease with its requested duration. Returns the
    /// previously requested duration if the lease was present.
    pub fn insert(
        &mut self,
        lease: Lease,
        duration: i64,
    ) -> Result<Option<i64>, RiverError> {
        if !self.can_contain_key(&lease) {
            return Err(RiverError::msg(format!(
                "lease {} cannot be batched with landlord {}",
                lease.cookie(),
                self.landlord.id()
            )));
        }
        if !valid_request(duration) {
            return Err(RiverError::msg(format!(
                "invalid duration {} for lease {}",
                duration,
                lease.cookie()
            )));
        }
        Ok(self
            .entries
            .insert(lease.cookie(), (lease, duration))
            .map(|(_, d)| d))
    }

    /// Requested duration for a lease.
    pub fn get(&self, lease: &Lease) -> Option<i64> {
        self.entries
            .get(&lease.cookie())
            .filter(|(l, _)| l == lease)
            .map(|&(_, d)| d)
    }

    /// Current value of a lease in the map, with its latest expiration.
    pub fn lease(&self, cookie: Uid) -> Option<&Lease> {
        self.entries.get(&cookie).map(|(l, _)| l)
    }

    pub fn contains_key(&self, lease: &Lease) -> bool {
        self.get(lease).is_some()
    }

    pub fn remove(&mut self, lease: &Lease) -> Option<(Lease, i64)> {
        if self.contains_key(lease) {
            self.entries.remove(&lease.cookie())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.entries.values().map(|(l, _)| l)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Lease, i64)> {
        self.entries.values().map(|(l, d)| (l, *d))
    }

    /// Renews every lease for its requested duration in one landlord call.
    /// Successful leases stay with updated expirations; failed ones are
    /// removed and reported.
    pub async fn renew_all(&mut self) -> Result<(), LeaseMapError> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let (cookies, durations): (Vec<Uid>, Vec<i64>) =
            self.entries.iter().map(|(&c, &(_, d))| (c, d)).unzip();

        let now = self.clock.now_ms();
        let outcomes: Vec<Result<i64, LeaseError>> = match self
            .landlord
            .remote()
            .renew_all(&cookies, &durations)
            .await
        {
            Ok(results) if results.len() == cookies.len() => results
                .iter()
                .map(|r| r.map_err(|e| e.clone()))
                .collect(),
            Ok(results) => {
                let e = LeaseError::Remote(format!(
                    "landlord answered {} results for {} leases",
                    results.len(),
                    cookies.len()
                ));
                vec![Err(e); cookies.len()]
            }
            Err(e) => vec![Err(e); cookies.len()],
        };

        let mut failures = HashMap::new();
        for (cookie, outcome) in cookies.into_iter().zip(outcomes) {
            match outcome {
                Ok(granted) => {
                    if let Some((lease, _)) = self.entries.get_mut(&cookie) {
                        lease.set_expiration(expiration_after(now, granted));
                    }
                }
                Err(e) => {
                    if let Some((lease, _)) = self.entries.remove(&cookie) {
                        pf_debug!("batch renew of {} failed: {}", cookie, e);
                        failures.insert(cookie, (lease, e));
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LeaseMapError { failures })
        }
    }

    /// Cancels every lease in one landlord call. Failed leases are removed
    /// and reported; cancelled ones remain as entries.
    pub async fn cancel_all(&mut self) -> Result<(), LeaseMapError> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let cookies: Vec<Uid> = self.entries.keys().copied().collect();

        let failed = match self.landlord.remote().cancel_all(&cookies).await {
            Ok(failed) => failed,
            Err(e) => cookies.iter().map(|&c| (c, e.clone())).collect(),
        };

        let mut failures = HashMap::new();
        for (cookie, e) in failed {
            if let Some((lease, _)) = self.entries.remove(&cookie) {
                pf_debug!("batch cancel of {} failed: {}", cookie, e);
                failures.insert(cookie, (lease, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LeaseMapError { failures })
        }
    }
}

impl fmt::Debug for LeaseMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LeaseMap")
            .field("landlord", &self.landlord)
            .field("entries", &self.entries)
            .finish()
    }
}

impl IntoIterator for LeaseMap {
    type Item = (Lease, i64);
    type IntoIter = hash_map::IntoValues<Uid, (Lease, i64)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

#[cfg(test)]
mod map_tests {
    use super::*;
    use crate::lease::{Landlord, LeasePolicy, ResourceLandlord, ANY};
    use crate::utils::{ManualClock, UidGenerator};
    use async_trait::async_trait;

    struct Fixture {
        clock: Arc<ManualClock>,
        landlord: Arc<ResourceLandlord<usize>>,
        leases: Vec<Lease>,
    }

    async fn fixture(n: usize) -> Result<Fixture, LeaseError> {
        let clock = Arc::new(ManualClock::new(0));
        let landlord = Arc::new(ResourceLandlord::new(
            LeasePolicy::default(),
            clock.clone(),
            Arc::new(UidGenerator::new()),
        ));
        let mut leases = Vec::with_capacity(n);
        for i in 0..n {
            let grant = landlord.grant(i, 1000).await?;
            leases.push(Lease::from_grant(
                &grant,
                landlord.landlord_ref(),
                clock.clone(),
            ));
        }
        Ok(Fixture {
            clock,
            landlord,
            leases,
        })
    }

    #[tokio::test]
    async fn insert_checks() -> Result<(), LeaseError> {
        let fx = fixture(2).await?;
        let mut map = fx.leases[0].create_lease_map(2000)?;
        assert_eq!(map.insert(fx.leases[1].clone(), ANY)?, None);
        assert_eq!(map.insert(fx.leases[1].clone(), 3000)?, Some(ANY));
        assert!(map.insert(fx.leases[1].clone(), -9).is_err());
        assert_eq!(map.get(&fx.leases[1]), Some(3000));

        let mut loner = fx.leases[1].clone();
        loner.set_batchable(false);
        assert!(!map.can_contain_key(&loner));
        assert!(map.insert(loner, 1000).is_err());
        assert_eq!(map.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn renew_all_success() -> Result<(), LeaseError> {
        let fx = fixture(3).await?;
        let mut map = fx.leases[0].create_lease_map(5000)?;
        for lease in &fx.leases[1..] {
            map.insert(lease.clone(), 5000)?;
        }
        fx.clock.advance(100);
        assert!(map.renew_all().await.is_ok());
        assert_eq!(map.len(), 3);
        for lease in map.leases() {
            assert_eq!(lease.expiration(), 5100);
        }
        Ok(())
    }

    #[tokio::test]
    async fn renew_all_drops_failed() -> Result<(), LeaseError> {
        let fx = fixture(5).await?;
        let mut map = fx.leases[0].create_lease_map(2000)?;
        for lease in &fx.leases[1..] {
            map.insert(lease.clone(), 2000)?;
        }
        fx.leases[3].cancel().await?;

        let err = map.renew_all().await.unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(
            err.get(&fx.leases[3]),
            Some(&LeaseError::UnknownLease(fx.leases[3].cookie()))
        );
        assert_eq!(map.len(), 4);
        assert!(!map.contains_key(&fx.leases[3]));

        // retry only covers the survivors
        assert!(map.renew_all().await.is_ok());
        assert_eq!(fx.landlord.len().await, 4);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_all_partial() -> Result<(), LeaseError> {
        let fx = fixture(3).await?;
        let mut map = fx.leases[0].create_lease_map(ANY)?;
        for lease in &fx.leases[1..] {
            map.insert(lease.clone(), ANY)?;
        }
        fx.leases[0].cancel().await?;

        let err = map.cancel_all().await.unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err.get(&fx.leases[0]).is_some());
        assert_eq!(map.len(), 2);
        assert!(fx.landlord.is_empty().await);
        Ok(())
    }

    /// Landlord that cannot be reached at all.
    struct Unreachable;

    #[async_trait]
    impl Landlord for Unreachable {
        async fn renew(&self, _: Uid, _: i64) -> Result<i64, LeaseError> {
            Err(LeaseError::Remote("connection refused".into()))
        }

        async fn cancel(&self, _: Uid) -> Result<(), LeaseError> {
            Err(LeaseError::Remote("connection refused".into()))
        }

        async fn renew_all(
            &self,
            _: &[Uid],
            _: &[i64],
        ) -> Result<crate::lease::RenewResults, LeaseError> {
            Err(LeaseError::Remote("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_fails_all() -> Result<(), RiverError> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let landlord = LandlordRef::new(Uid(1), Arc::new(Unreachable));
        let mut map = LeaseMap::new(landlord.clone(), clock.clone());
        for c in 10..13 {
            map.insert(Lease::new(Uid(c), 1000, landlord.clone(), clock.clone()), 1000)?;
        }
        let err = map.renew_all().await.unwrap_err();
        assert_eq!(err.len(), 3);
        assert!(map.is_empty());
        assert!(err
            .failures()
            .values()
            .all(|(_, e)| matches!(e, LeaseError::Remote(_))));
        Ok(())
    }
}
