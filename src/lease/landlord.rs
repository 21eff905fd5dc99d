//! Landlord protocol and the table-backed landlord implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::lease::{
    expiration_after, LeaseError, LeasePolicy, LeasedResource,
};
use crate::utils::{Clock, Timer, Uid, UidGenerator};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Server-side lease authority contract. Durations are in ms; successful
/// renewals answer with the granted duration, from which the holder derives
/// its new expiration on its own clock.
#[async_trait]
pub trait Landlord: Send + Sync {
    /// Extends one lease by `duration` ms.
    async fn renew(&self, cookie: Uid, duration: i64) -> Result<i64, LeaseError>;

    /// Removes one lease. A second cancel of the same cookie is an
    /// `UnknownLease` error.
    async fn cancel(&self, cookie: Uid) -> Result<(), LeaseError>;

    /// Renews each cookie independently. An `Err` means the call as a whole
    /// failed (unreachable grantor or malformed input), never that one item
    /// failed.
    async fn renew_all(
        &self,
        cookies: &[Uid],
        durations: &[i64],
    ) -> Result<RenewResults, LeaseError> {
        if cookies.len() != durations.len() {
            return Err(LeaseError::Denied(format!(
                "{} cookies given with {} durations",
                cookies.len(),
                durations.len()
            )));
        }
        let mut results = RenewResults::with_capacity(cookies.len());
        for (&cookie, &duration) in cookies.iter().zip(durations) {
            results.push(self.renew(cookie, duration).await);
        }
        Ok(results)
    }

    /// Cancels each cookie independently. Returns the failed cookies mapped
    /// to their errors; empty if everything succeeded.
    async fn cancel_all(
        &self,
        cookies: &[Uid],
    ) -> Result<HashMap<Uid, LeaseError>, LeaseError> {
        let mut failed = HashMap::new();
        for &cookie in cookies {
            if let Err(e) = self.cancel(cookie).await {
                failed.insert(cookie, e);
            }
        }
        Ok(failed)
    }
}

/// Outcome of a batch renewal: parallel per-cookie arrays where exactly one
/// of `granted[i] >= 0` or `denied[i].is_some()` holds.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct RenewResults {
    granted: Vec<i64>,
    denied: Vec<Option<LeaseError>>,
}

impl RenewResults {
    /// Value placed in `granted` for an index that failed.
    pub const FAILED: i64 = -1;

    pub fn with_capacity(n: usize) -> Self {
        RenewResults {
            granted: Vec::with_capacity(n),
            denied: Vec::with_capacity(n),
        }
    }

    /// Appends the outcome for the next cookie.
    pub fn push(&mut self, outcome: Result<i64, LeaseError>) {
        match outcome {
            Ok(duration) if duration >= 0 => {
                self.granted.push(duration);
                self.denied.push(None);
            }
            Ok(duration) => {
                self.granted.push(Self::FAILED);
                self.denied.push(Some(LeaseError::Denied(format!(
                    "negative grant {}",
                    duration
                ))));
            }
            Err(e) => {
                self.granted.push(Self::FAILED);
                self.denied.push(Some(e));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.granted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }

    pub fn granted(&self) -> &[i64] {
        &self.granted
    }

    pub fn denied(&self) -> &[Option<LeaseError>] {
        &self.denied
    }

    /// Outcome at index `i`.
    pub fn get(&self, i: usize) -> Option<Result<i64, &LeaseError>> {
        match self.denied.get(i)? {
            Some(e) => Some(Err(e)),
            None => self.granted.get(i).map(|&d| Ok(d)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<i64, &LeaseError>> {
        self.granted.iter().zip(self.denied.iter()).map(|(&d, e)| match e {
            Some(e) => Err(e),
            None => Ok(d),
        })
    }
}

/// Client-side reference to a landlord endpoint. Two references with the same
/// identity point at the same grantor and may be batched together.
#[derive(Clone)]
pub struct LandlordRef {
    id: Uid,
    remote: Arc<dyn Landlord>,
}

impl LandlordRef {
    pub fn new(id: Uid, remote: Arc<dyn Landlord>) -> Self {
        LandlordRef { id, remote }
    }

    pub fn id(&self) -> Uid {
        self.id
    }

    pub fn remote(&self) -> &Arc<dyn Landlord> {
        &self.remote
    }

    /// True if both references denote the same grantor.
    pub fn same_as(&self, other: &LandlordRef) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for LandlordRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LandlordRef({})", self.id)
    }
}

/// Result of granting a new lease.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Grant {
    pub cookie: Uid,
    pub duration: i64,
    pub expiration: i64,
}

/// Landlord backed by an in-memory table of leased resources.
pub struct ResourceLandlord<R> {
    /// Identity used by clients to decide batchability.
    id: Uid,

    policy: LeasePolicy,

    clock: Arc<dyn Clock>,

    uids: Arc<UidGenerator>,

    /// Map from cookie -> current resource record. Renewal swaps in a new
    /// record instead of mutating the old one.
    table: RwLock<HashMap<Uid, Arc<LeasedResource<R>>>>,
}

impl<R> ResourceLandlord<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Creates a landlord drawing its identity and cookies from `uids`.
    pub fn new(
        policy: LeasePolicy,
        clock: Arc<dyn Clock>,
        uids: Arc<UidGenerator>,
    ) -> Self {
        ResourceLandlord {
            id: uids.generate(),
            policy,
            clock,
            uids,
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uid {
        self.id
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }

    /// Reference handed to clients.
    pub fn landlord_ref(self: &Arc<Self>) -> LandlordRef {
        LandlordRef::new(self.id, self.clone())
    }

    /// Grants a new lease on `resource` for (at most) `duration` ms.
    pub async fn grant(
        &self,
        resource: R,
        duration: i64,
    ) -> Result<Grant, LeaseError> {
        let granted = self.policy.grant(duration)?;
        let cookie = self.uids.generate();
        let expiration = expiration_after(self.clock.now_ms(), granted);
        self.table.write().await.insert(
            cookie,
            Arc::new(LeasedResource::new(cookie, expiration, resource)),
        );
        pf_trace!("granted lease {} for {} ms", cookie, granted);
        Ok(Grant {
            cookie,
            duration: granted,
            expiration,
        })
    }

    /// Snapshot of a live (unexpired) resource.
    pub async fn get(&self, cookie: Uid) -> Option<Arc<LeasedResource<R>>> {
        let now = self.clock.now_ms();
        self.table
            .read()
            .await
            .get(&cookie)
            .filter(|res| !res.is_expired(now))
            .cloned()
    }

    /// Number of records held, including expired ones not yet reaped.
    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }

    /// Drops every expired record. Returns the number dropped.
    pub async fn reap_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut table = self.table.write().await;
        let before = table.len();
        table.retain(|_, res| !res.is_expired(now));
        let reaped = before - table.len();
        if reaped > 0 {
            pf_debug!("reaped {} expired leases", reaped);
        }
        reaped
    }

    /// Spawns a task reaping expired records every `interval`. The task ends
    /// once the landlord is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let landlord: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            pf_debug!("lease reaper task spawned");
            let mut timer = Timer::new();
            loop {
                if let Err(e) = timer.restart(interval) {
                    pf_error!("error restarting reaper timer: {}", e);
                    break;
                }
                timer.timeout().await;
                match landlord.upgrade() {
                    Some(landlord) => {
                        landlord.reap_expired().await;
                    }
                    None => break,
                }
            }
            pf_debug!("lease reaper task exited");
        })
    }
}

#[async_trait]
impl<R> Landlord for ResourceLandlord<R>
where
    R: Clone + Send + Sync + 'static,
{
    async fn renew(&self, cookie: Uid, duration: i64) -> Result<i64, LeaseError> {
        let now = self.clock.now_ms();
        let mut table = self.table.write().await;

        let current = match table.get(&cookie) {
            Some(res) if !res.is_expired(now) => res.clone(),
            Some(_) => {
                table.remove(&cookie);
                return Err(LeaseError::UnknownLease(cookie));
            }
            None => return Err(LeaseError::UnknownLease(cookie)),
        };

        let granted = self.policy.grant(duration)?;
        let expiration = expiration_after(now, granted);
        if expiration < current.expiration() {
            // expirations never move backwards
            return Err(LeaseError::Denied(format!(
                "renewal to {} would precede current expiration {}",
                expiration,
                current.expiration()
            )));
        }

        table.insert(cookie, Arc::new(current.renew(expiration)));
        pf_trace!("renewed lease {} for {} ms", cookie, granted);
        Ok(granted)
    }

    async fn cancel(&self, cookie: Uid) -> Result<(), LeaseError> {
        let now = self.clock.now_ms();
        match self.table.write().await.remove(&cookie) {
            Some(res) if !res.is_expired(now) => {
                pf_trace!("cancelled lease {}", cookie);
                Ok(())
            }
            _ => Err(LeaseError::UnknownLease(cookie)),
        }
    }
}
