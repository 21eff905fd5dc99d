//! Client-side lease renewal manager implementation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::lease::{
    expiration_after, valid_request, Lease, LeaseError, LeaseMap, ANY, FOREVER,
};
use crate::utils::{Clock, RiverError, Timer, Uid};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Longest the scheduler sleeps before re-checking the table.
const MAX_SLEEP_MS: i64 = 60_000;

/// Key of a tracked lease: (landlord id, cookie).
type LeaseKey = (Uid, Uid);

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalConfig {
    /// Fraction of the last granted duration by which a renewal is attempted
    /// ahead of expiration.
    pub renew_ahead_fraction: f64,

    /// Lower bound on the renewal-ahead window, in ms.
    pub min_renew_ahead_ms: i64,

    /// Leases of the same landlord coming due within this window of a due
    /// lease are renewed in the same call, in ms.
    pub batch_window_ms: i64,

    /// Duration requested per renewal unless the caller specifies one, in ms.
    pub default_renew_duration_ms: i64,

    /// Tolerance when deciding a lease is already expired at manage time.
    pub clock_skew_ms: i64,

    /// Maximum number of landlord calls in flight.
    pub max_inflight_renewals: usize,

    /// Per-call timeout in ms; 0 means wait indefinitely.
    pub call_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for RenewalConfig {
    fn default() -> Self {
        RenewalConfig {
            renew_ahead_fraction: 0.5,
            min_renew_ahead_ms: 50,
            batch_window_ms: 100,
            default_renew_duration_ms: 300_000,
            clock_skew_ms: 1000,
            max_inflight_renewals: 8,
            call_timeout_ms: 0,
        }
    }
}

impl RenewalConfig {
    /// Composes a config from defaults overridden by an optional TOML string.
    pub fn from_config_str(config_str: Option<&str>) -> Result<Self, RiverError> {
        let config = parsed_config!(config_str => RenewalConfig;
                                    renew_ahead_fraction, min_renew_ahead_ms,
                                    batch_window_ms, default_renew_duration_ms,
                                    clock_skew_ms, max_inflight_renewals,
                                    call_timeout_ms)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), RiverError> {
        if !(self.renew_ahead_fraction > 0.0 && self.renew_ahead_fraction <= 1.0)
        {
            return logged_err!(
                "invalid renew_ahead_fraction {}",
                self.renew_ahead_fraction
            );
        }
        if self.min_renew_ahead_ms < 0 || self.batch_window_ms < 0 {
            return logged_err!(
                "invalid renewal windows: min_ahead {} batch {}",
                self.min_renew_ahead_ms,
                self.batch_window_ms
            );
        }
        if !valid_request(self.default_renew_duration_ms)
            || self.default_renew_duration_ms == 0
        {
            return logged_err!(
                "invalid default_renew_duration_ms {}",
                self.default_renew_duration_ms
            );
        }
        if self.clock_skew_ms < 0 {
            return logged_err!("invalid clock_skew_ms {}", self.clock_skew_ms);
        }
        if self.max_inflight_renewals == 0 {
            return logged_err!("max_inflight_renewals must be positive");
        }
        Ok(())
    }

    /// Time at which a lease should next be renewed. Equals `desired` when the
    /// lease already reaches its desired expiration.
    fn renew_at(&self, expiration: i64, granted: i64, desired: i64, now: i64) -> i64 {
        if expiration >= desired {
            return desired;
        }
        let ahead = (granted.max(0) as f64 * self.renew_ahead_fraction) as i64;
        let ahead = ahead.max(self.min_renew_ahead_ms);
        expiration.saturating_sub(ahead).max(now)
    }
}

/// Callbacks for leases handed to the manager.
pub trait LeaseListener: Send + Sync {
    /// A renewal failed; the lease is no longer managed.
    fn notify(&self, event: LeaseRenewalEvent);

    /// The lease reached its desired expiration; the lease is no longer
    /// managed. Ignored unless overridden.
    fn expiration_reached(&self, event: LeaseRenewalEvent) {
        let _ = event;
    }
}

/// Event delivered to a `LeaseListener`.
#[derive(Debug, Clone)]
pub struct LeaseRenewalEvent {
    /// Latest value of the lease.
    pub lease: Lease,

    /// Desired expiration the lease was managed towards.
    pub expiration: i64,

    /// Failure cause; `None` for desired-expiration-reached events.
    pub error: Option<LeaseError>,
}

/// Listener invocation prepared under the table lock and run after it.
enum Delivery {
    Failure(Arc<dyn LeaseListener>, LeaseRenewalEvent),
    Reached(Arc<dyn LeaseListener>, LeaseRenewalEvent),
}

impl Delivery {
    fn deliver(self) {
        match self {
            Delivery::Failure(listener, event) => listener.notify(event),
            Delivery::Reached(listener, event) => {
                listener.expiration_reached(event)
            }
        }
    }
}

/// One tracked lease.
struct Entry {
    lease: Lease,
    desired_exp: i64,
    renew_duration: i64,
    listener: Option<Arc<dyn LeaseListener>>,

    /// Last granted duration, basis of the renewal-ahead window.
    granted: i64,

    /// Time at which the next renewal (or removal) is due.
    renew_at: i64,

    /// Distinguishes re-managed entries so stale call results are dropped.
    generation: u64,
}

impl Entry {
    fn reached(&self) -> bool {
        self.lease.expiration() >= self.desired_exp
    }

    /// Duration to request now, never overshooting the desired expiration.
    fn request_duration(&self, now: i64) -> i64 {
        if self.desired_exp == FOREVER {
            return self.renew_duration;
        }
        let remaining = self.desired_exp - now;
        if self.renew_duration == ANY || self.renew_duration > remaining {
            remaining
        } else {
            self.renew_duration
        }
    }

    fn into_delivery(self, error: Option<LeaseError>) -> Option<Delivery> {
        let listener = self.listener?;
        let event = LeaseRenewalEvent {
            lease: self.lease,
            expiration: self.desired_exp,
            error: error.clone(),
        };
        Some(match error {
            Some(_) => Delivery::Failure(listener, event),
            None => Delivery::Reached(listener, event),
        })
    }
}

#[derive(Default)]
struct Table {
    entries: HashMap<LeaseKey, Entry>,

    /// Keys with a landlord call in flight; at most one per lease.
    inflight: HashSet<LeaseKey>,

    next_gen: u64,
}

/// Renewal of one lease inside a batch.
struct WorkItem {
    key: LeaseKey,
    lease: Lease,
    generation: u64,
}

/// State shared between the manager handles, the scheduler task, and the
/// renewal workers.
struct Shared {
    config: RenewalConfig,
    clock: Arc<dyn Clock>,
    table: Mutex<Table>,
    wakeup: Notify,
    workers: Arc<Semaphore>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Picks due entries, marks them in flight, and groups those sharing a
    /// batchable landlord. Also removes entries whose desired expiration came
    /// without renewal. Returns the batches, deliveries to make, and the next
    /// due time among idle entries.
    fn collect_due(&self) -> (Vec<Vec<WorkItem>>, Vec<Delivery>, Option<i64>) {
        let now = self.clock.now_ms();
        let mut table = self.table();
        let Table {
            entries, inflight, ..
        } = &mut *table;

        let mut deliveries = vec![];
        let finished: Vec<LeaseKey> = entries
            .iter()
            .filter(|(k, e)| {
                !inflight.contains(*k)
                    && e.renew_at <= now
                    && (e.reached() || e.desired_exp <= now)
            })
            .map(|(k, _)| *k)
            .collect();
        for key in finished {
            if let Some(entry) = entries.remove(&key) {
                pf_debug!("lease {} reached desired expiration", key.1);
                deliveries.extend(entry.into_delivery(None));
            }
        }

        let mut groups: HashMap<Uid, Vec<LeaseKey>> = HashMap::new();
        let mut singles = vec![];
        for (key, entry) in entries.iter() {
            if inflight.contains(key) || entry.renew_at > now {
                continue;
            }
            if entry.lease.is_batchable() {
                groups
                    .entry(entry.lease.landlord().id())
                    .or_default()
                    .push(*key);
            } else {
                singles.push(*key);
            }
        }

        // pull in batch-mates coming due shortly
        let horizon = now.saturating_add(self.config.batch_window_ms);
        for (key, entry) in entries.iter() {
            if inflight.contains(key)
                || entry.renew_at <= now
                || entry.renew_at > horizon
                || entry.reached()
                || !entry.lease.is_batchable()
            {
                continue;
            }
            if let Some(group) = groups.get_mut(&entry.lease.landlord().id()) {
                group.push(*key);
            }
        }

        let mut batches = vec![];
        for keys in groups.into_values().chain(singles.into_iter().map(|k| vec![k])) {
            let batch: Vec<WorkItem> = keys
                .into_iter()
                .filter_map(|key| {
                    let entry = entries.get(&key)?;
                    inflight.insert(key);
                    Some(WorkItem {
                        key,
                        lease: entry.lease.clone(),
                        generation: entry.generation,
                    })
                })
                .collect();
            if !batch.is_empty() {
                batches.push(batch);
            }
        }

        let next_due = entries
            .iter()
            .filter(|(k, _)| !inflight.contains(*k))
            .map(|(_, e)| e.renew_at)
            .min();
        (batches, deliveries, next_due)
    }

    /// Fixes the duration of each item at the moment its call goes out. Items
    /// no longer tracked, or whose desired expiration has already come, are
    /// released from flight and left to the scheduler.
    fn request_durations(&self, batch: Vec<WorkItem>) -> Vec<(WorkItem, i64)> {
        let now = self.clock.now_ms();
        let mut table = self.table();
        let Table {
            entries, inflight, ..
        } = &mut *table;

        let mut requests = Vec::with_capacity(batch.len());
        for item in batch {
            let duration = match entries.get(&item.key) {
                Some(entry) if entry.generation == item.generation => {
                    entry.request_duration(now)
                }
                _ => 0,
            };
            if duration == ANY || duration > 0 {
                requests.push((item, duration));
            } else {
                inflight.remove(&item.key);
            }
        }
        requests
    }

    /// Applies call outcomes to the table. Results for entries removed or
    /// re-managed meanwhile are discarded.
    fn apply(
        &self,
        started: i64,
        outcomes: Vec<(WorkItem, Result<Lease, LeaseError>)>,
    ) -> Vec<Delivery> {
        let now = self.clock.now_ms();
        let mut table = self.table();
        let Table {
            entries, inflight, ..
        } = &mut *table;

        let mut deliveries = vec![];
        for (item, outcome) in outcomes {
            inflight.remove(&item.key);
            let entry = match entries.get_mut(&item.key) {
                Some(entry) if entry.generation == item.generation => entry,
                _ => {
                    pf_debug!(
                        "discarding renewal result of untracked lease {}",
                        item.key.1
                    );
                    continue;
                }
            };

            let error = match outcome {
                Ok(lease) => {
                    entry.granted = if lease.expiration() == FOREVER {
                        FOREVER
                    } else {
                        lease.expiration() - started
                    };
                    entry.lease = lease;
                    if !entry.reached() {
                        entry.renew_at = self.config.renew_at(
                            entry.lease.expiration(),
                            entry.granted,
                            entry.desired_exp,
                            now,
                        );
                        continue;
                    }
                    None
                }
                Err(e) => {
                    pf_debug!("renewal of lease {} failed: {}", item.key.1, e);
                    Some(e)
                }
            };

            // removed before any listener runs
            if let Some(entry) = entries.remove(&item.key) {
                deliveries.extend(entry.into_delivery(error));
            }
        }
        deliveries
    }
}

/// Aborts the scheduler task once the last manager handle is gone.
struct SchedulerGuard(JoinHandle<()>);

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Background renewal manager.
///
/// Tracks leases towards client-chosen desired expirations. One scheduler
/// task sleeps until the earliest renewal is due, then hands due leases to
/// workers (bounded by `max_inflight_renewals`); leases of one batchable
/// landlord coming due together go out as a single `renew_all` call. A failed
/// renewal removes the lease before its listener is told, so listeners may
/// call back into the manager.
///
/// Handles are cheap to clone. Must be created within a tokio runtime.
#[derive(Clone)]
pub struct LeaseRenewalManager {
    shared: Arc<Shared>,
    _scheduler: Arc<SchedulerGuard>,
}

impl fmt::Debug for LeaseRenewalManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LeaseRenewalManager({} leases)", self.len())
    }
}

// LeaseRenewalManager public API implementation
impl LeaseRenewalManager {
    /// Creates a new renewal manager and spawns its scheduler task.
    pub fn new_and_setup(
        config: RenewalConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RiverError> {
        config.validate()?;
        let workers = Arc::new(Semaphore::new(config.max_inflight_renewals));
        let shared = Arc::new(Shared {
            config,
            clock,
            table: Mutex::new(Table::default()),
            wakeup: Notify::new(),
            workers,
        });

        let scheduler = tokio::spawn(Self::scheduler_task(shared.clone()));
        Ok(LeaseRenewalManager {
            shared,
            _scheduler: Arc::new(SchedulerGuard(scheduler)),
        })
    }

    /// Renews the lease until `desired_exp` with the default renew duration
    /// and no listener.
    pub fn manage(&self, lease: Lease, desired_exp: i64) -> Result<(), RiverError> {
        self.renew_until_with(
            lease,
            desired_exp,
            self.shared.config.default_renew_duration_ms,
            None,
        )
    }

    /// Renews the lease until `desired_exp`, reporting to `listener`.
    pub fn renew_until(
        &self,
        lease: Lease,
        desired_exp: i64,
        listener: Option<Arc<dyn LeaseListener>>,
    ) -> Result<(), RiverError> {
        self.renew_until_with(
            lease,
            desired_exp,
            self.shared.config.default_renew_duration_ms,
            listener,
        )
    }

    /// Renews the lease for `desired_duration` ms from now, asking for
    /// `renew_duration` ms per renewal.
    pub fn renew_for(
        &self,
        lease: Lease,
        desired_duration: i64,
        renew_duration: i64,
        listener: Option<Arc<dyn LeaseListener>>,
    ) -> Result<(), RiverError> {
        if desired_duration < 0 {
            return logged_err!("invalid desired duration {}", desired_duration);
        }
        let desired_exp =
            expiration_after(self.shared.clock.now_ms(), desired_duration);
        self.renew_until_with(lease, desired_exp, renew_duration, listener)
    }

    /// Renews the lease until `desired_exp`, asking for `renew_duration` ms
    /// per renewal. Replaces any existing entry for the same lease. A lease
    /// already past expiration is reported to the listener right away.
    pub fn renew_until_with(
        &self,
        lease: Lease,
        desired_exp: i64,
        renew_duration: i64,
        listener: Option<Arc<dyn LeaseListener>>,
    ) -> Result<(), RiverError> {
        if !valid_request(renew_duration) || renew_duration == 0 {
            return logged_err!("invalid renew duration {}", renew_duration);
        }
        if desired_exp < 0 {
            return logged_err!("invalid desired expiration {}", desired_exp);
        }

        let now = self.shared.clock.now_ms();
        let key = lease.key();
        if lease.expiration() != FOREVER
            && lease
                .expiration()
                .saturating_add(self.shared.config.clock_skew_ms)
                < now
        {
            self.shared.table().entries.remove(&key);
            pf_debug!(
                "lease {} expired at {} before being managed",
                lease.cookie(),
                lease.expiration()
            );
            if let Some(listener) = listener {
                let cookie = lease.cookie();
                listener.notify(LeaseRenewalEvent {
                    lease,
                    expiration: desired_exp,
                    error: Some(LeaseError::UnknownLease(cookie)),
                });
            }
            return Ok(());
        }

        let granted = if lease.expiration() == FOREVER {
            FOREVER
        } else {
            (lease.expiration() - now).max(0)
        };
        let renew_at = self.shared.config.renew_at(
            lease.expiration(),
            granted,
            desired_exp,
            now,
        );
        pf_debug!(
            "managing lease {} until {} (next at {})",
            lease.cookie(),
            desired_exp,
            renew_at
        );
        {
            let mut table = self.shared.table();
            let generation = table.next_gen;
            table.next_gen += 1;
            table.entries.insert(
                key,
                Entry {
                    lease,
                    desired_exp,
                    renew_duration,
                    listener,
                    granted,
                    renew_at,
                    generation,
                },
            );
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Changes the desired expiration of a managed lease.
    pub fn set_expiration(
        &self,
        lease: &Lease,
        desired_exp: i64,
    ) -> Result<(), RiverError> {
        if desired_exp < 0 {
            return logged_err!("invalid desired expiration {}", desired_exp);
        }
        let now = self.shared.clock.now_ms();
        {
            let mut table = self.shared.table();
            let entry = match table.entries.get_mut(&lease.key()) {
                Some(entry) => entry,
                None => {
                    return Err(RiverError::msg(format!(
                        "lease {} is not managed",
                        lease.cookie()
                    )))
                }
            };
            entry.desired_exp = desired_exp;
            entry.renew_at = self.shared.config.renew_at(
                entry.lease.expiration(),
                entry.granted,
                desired_exp,
                now,
            );
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Last known actual expiration of a managed lease.
    pub fn get_expiration(&self, lease: &Lease) -> Result<i64, RiverError> {
        self.shared
            .table()
            .entries
            .get(&lease.key())
            .map(|e| e.lease.expiration())
            .ok_or_else(|| {
                RiverError::msg(format!("lease {} is not managed", lease.cookie()))
            })
    }

    /// Stops managing a lease without contacting its landlord.
    pub fn remove(&self, lease: &Lease) -> Result<(), RiverError> {
        match self.shared.table().entries.remove(&lease.key()) {
            Some(_) => Ok(()),
            None => Err(RiverError::msg(format!(
                "lease {} is not managed",
                lease.cookie()
            ))),
        }
    }

    /// Stops managing a lease and cancels it at its landlord.
    pub async fn cancel(&self, lease: &Lease) -> Result<(), LeaseError> {
        let tracked = self.shared.table().entries.remove(&lease.key());
        let lease = tracked.map(|e| e.lease).unwrap_or_else(|| lease.clone());
        lease.cancel().await
    }

    /// Stops managing every lease.
    pub fn clear(&self) {
        self.shared.table().entries.clear();
    }

    /// Number of managed leases.
    pub fn len(&self) -> usize {
        self.shared.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// LeaseRenewalManager scheduler and worker tasks implementation
impl LeaseRenewalManager {
    /// Scheduler loop: dispatches due renewals and sleeps until the next due
    /// time or a table change. Never awaits a landlord call itself.
    async fn scheduler_task(shared: Arc<Shared>) {
        pf_debug!("renewal scheduler task spawned");

        let mut timer = Timer::new();
        loop {
            let (batches, deliveries, next_due) = shared.collect_due();
            for batch in batches {
                pf_trace!("dispatching renewal batch of {}", batch.len());
                tokio::spawn(Self::renewal_task(shared.clone(), batch));
            }
            if !deliveries.is_empty() {
                tokio::spawn(async move {
                    for delivery in deliveries {
                        delivery.deliver();
                    }
                });
            }

            match next_due {
                Some(due) => {
                    let wait = due
                        .saturating_sub(shared.clock.now_ms())
                        .clamp(0, MAX_SLEEP_MS);
                    timer.restart_at(
                        Instant::now() + Duration::from_millis(wait as u64),
                    );
                    tokio::select! {
                        _ = timer.timeout() => {},
                        _ = shared.wakeup.notified() => {},
                    }
                }
                None => shared.wakeup.notified().await,
            }
        }
    }

    /// Worker: performs one single or batched landlord call and applies the
    /// outcome.
    async fn renewal_task(shared: Arc<Shared>, batch: Vec<WorkItem>) {
        // the semaphore is never closed
        let _permit = shared.workers.clone().acquire_owned().await.ok();
        let timeout_ms = shared.config.call_timeout_ms;
        let started = shared.clock.now_ms();
        let batch = shared.request_durations(batch);
        if batch.is_empty() {
            shared.wakeup.notify_one();
            return;
        }

        let outcomes = if batch.len() == 1 {
            let mut outcomes = Vec::with_capacity(1);
            for (item, duration) in batch {
                let mut lease = item.lease.clone();
                let res = with_timeout(timeout_ms, lease.renew(duration))
                    .await
                    .and_then(|res| res);
                outcomes.push((item, res.map(|()| lease)));
            }
            outcomes
        } else {
            Self::renew_batch(&shared, batch, timeout_ms).await
        };

        let deliveries = shared.apply(started, outcomes);
        shared.wakeup.notify_one();
        for delivery in deliveries {
            delivery.deliver();
        }
    }

    /// Renews a batch through one `LeaseMap::renew_all` call.
    async fn renew_batch(
        shared: &Shared,
        batch: Vec<(WorkItem, i64)>,
        timeout_ms: u64,
    ) -> Vec<(WorkItem, Result<Lease, LeaseError>)> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let landlord = batch[0].0.lease.landlord().clone();
        let mut map = LeaseMap::new(landlord, shared.clock.clone());

        let mut batched = Vec::with_capacity(batch.len());
        for (item, duration) in batch {
            match map.insert(item.lease.clone(), duration) {
                Ok(_) => batched.push(item),
                Err(e) => {
                    outcomes.push((item, Err(LeaseError::Denied(e.to_string()))))
                }
            }
        }

        let mut failures = match with_timeout(timeout_ms, map.renew_all()).await {
            Ok(Ok(())) => HashMap::new(),
            Ok(Err(e)) => e.into_failures(),
            Err(e) => batched
                .iter()
                .map(|item| (item.lease.cookie(), (item.lease.clone(), e.clone())))
                .collect(),
        };

        for item in batched {
            let cookie = item.lease.cookie();
            let outcome = match failures.remove(&cookie) {
                Some((_, e)) => Err(e),
                None => map.lease(cookie).cloned().ok_or_else(|| {
                    LeaseError::Remote(format!("lease {} lost from batch", cookie))
                }),
            };
            outcomes.push((item, outcome));
        }
        outcomes
    }
}

/// Runs a landlord call with an optional timeout; an elapsed timeout counts
/// as a communication failure.
async fn with_timeout<T, F>(timeout_ms: u64, call: F) -> Result<T, LeaseError>
where
    F: Future<Output = T>,
{
    if timeout_ms == 0 {
        return Ok(call.await);
    }
    time::timeout(Duration::from_millis(timeout_ms), call)
        .await
        .map_err(|_| {
            LeaseError::Remote(format!(
                "landlord call timed out after {} ms",
                timeout_ms
            ))
        })
}

#[cfg(test)]
mod renewal_tests {
    use super::*;
    use crate::lease::{
        Landlord, LandlordRef, LeasePolicy, RenewResults, ResourceLandlord,
    };
    use crate::utils::{SystemClock, UidGenerator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Landlord wrapper counting calls, optionally slow.
    struct Counting {
        inner: Arc<ResourceLandlord<u32>>,
        delay: Duration,
        renews: AtomicUsize,
        batches: AtomicUsize,
    }

    #[async_trait]
    impl Landlord for Counting {
        async fn renew(&self, cookie: Uid, duration: i64) -> Result<i64, LeaseError> {
            self.renews.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            self.inner.renew(cookie, duration).await
        }

        async fn cancel(&self, cookie: Uid) -> Result<(), LeaseError> {
            self.inner.cancel(cookie).await
        }

        async fn renew_all(
            &self,
            cookies: &[Uid],
            durations: &[i64],
        ) -> Result<RenewResults, LeaseError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.inner.renew_all(cookies, durations).await
        }
    }

    #[derive(Default)]
    struct Recorder {
        failures: Mutex<Vec<LeaseRenewalEvent>>,
        reached: Mutex<Vec<LeaseRenewalEvent>>,
    }

    impl LeaseListener for Recorder {
        fn notify(&self, event: LeaseRenewalEvent) {
            self.failures.lock().unwrap().push(event);
        }

        fn expiration_reached(&self, event: LeaseRenewalEvent) {
            self.reached.lock().unwrap().push(event);
        }
    }

    struct Fixture {
        clock: Arc<SystemClock>,
        landlord: Arc<ResourceLandlord<u32>>,
        counting: Arc<Counting>,
        manager: LeaseRenewalManager,
    }

    impl Fixture {
        fn new(
            max_ms: i64,
            delay_ms: u64,
            config: RenewalConfig,
        ) -> Result<Self, RiverError> {
            let clock = Arc::new(SystemClock::new());
            let landlord = Arc::new(ResourceLandlord::new(
                LeasePolicy {
                    default_duration_ms: max_ms,
                    max_duration_ms: max_ms,
                    deny_over_max: false,
                },
                clock.clone(),
                Arc::new(UidGenerator::new()),
            ));
            let counting = Arc::new(Counting {
                inner: landlord.clone(),
                delay: Duration::from_millis(delay_ms),
                renews: AtomicUsize::new(0),
                batches: AtomicUsize::new(0),
            });
            let manager = LeaseRenewalManager::new_and_setup(config, clock.clone())?;
            Ok(Fixture {
                clock,
                landlord,
                counting,
                manager,
            })
        }

        async fn lease(&self, duration: i64) -> Result<Lease, LeaseError> {
            let grant = self.landlord.grant(0, duration).await?;
            Ok(Lease::from_grant(
                &grant,
                LandlordRef::new(self.landlord.id(), self.counting.clone()),
                self.clock.clone(),
            ))
        }

        fn now(&self) -> i64 {
            self.clock.now_ms()
        }

        fn renews(&self) -> usize {
            self.counting.renews.load(Ordering::SeqCst)
        }

        fn batches(&self) -> usize {
            self.counting.batches.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn parse_config() -> Result<(), RiverError> {
        let config = RenewalConfig::from_config_str(Some(
            "renew_ahead_fraction = 0.25\nbatch_window_ms = 0",
        ))?;
        assert_eq!(config.renew_ahead_fraction, 0.25);
        assert_eq!(config.batch_window_ms, 0);
        assert_eq!(config.max_inflight_renewals, 8);
        assert!(RenewalConfig::from_config_str(Some("renew_ahead_fraction = 1.5"))
            .is_err());
        assert!(RenewalConfig::from_config_str(Some("max_inflight_renewals = 0"))
            .is_err());
        assert!(RenewalConfig::from_config_str(Some("bogus = 3")).is_err());
        Ok(())
    }

    #[test]
    fn renew_ahead_window() {
        let config = RenewalConfig::default();
        assert_eq!(config.renew_at(10_000, 1000, FOREVER, 9000), 9500);
        assert_eq!(config.renew_at(10_000, 60, FOREVER, 9000), 9950);
        assert_eq!(config.renew_at(10_000, 4000, FOREVER, 9000), 9000);
        assert_eq!(config.renew_at(10_000, 1000, 10_000, 9000), 10_000);
        assert_eq!(config.renew_at(FOREVER, FOREVER, FOREVER, 0), FOREVER);
    }

    #[tokio::test(start_paused = true)]
    async fn renews_until_desired() -> Result<(), LeaseError> {
        let fx = Fixture::new(1000, 0, RenewalConfig::default())?;
        let lease = fx.lease(1000).await?;
        let desired = fx.now() + 5000;
        let recorder = Arc::new(Recorder::default());
        fx.manager
            .renew_until(lease.clone(), desired, Some(recorder.clone()))?;

        time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fx.manager.len(), 1);
        assert!(fx.manager.get_expiration(&lease)? > fx.now());
        assert!(fx.manager.get_expiration(&lease)? <= desired);

        time::sleep(Duration::from_millis(3000)).await;
        assert!(fx.manager.is_empty());
        {
            let reached = recorder.reached.lock().unwrap();
            assert_eq!(reached.len(), 1);
            assert_eq!(reached[0].expiration, desired);
            assert_eq!(reached[0].lease.expiration(), desired);
            assert!(reached[0].error.is_none());
        }
        assert!(recorder.failures.lock().unwrap().is_empty());

        let calls = fx.renews();
        assert!(calls >= 4);
        time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fx.renews(), calls);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn desired_within_lease() -> Result<(), LeaseError> {
        let fx = Fixture::new(5000, 0, RenewalConfig::default())?;
        let lease = fx.lease(5000).await?;
        let recorder = Arc::new(Recorder::default());
        fx.manager
            .renew_until(lease, fx.now() + 2000, Some(recorder.clone()))?;
        time::sleep(Duration::from_millis(2500)).await;
        assert!(fx.manager.is_empty());
        assert_eq!(fx.renews(), 0);
        assert_eq!(recorder.reached.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batches_same_landlord() -> Result<(), LeaseError> {
        let fx = Fixture::new(1000, 0, RenewalConfig::default())?;
        let mut leases = vec![];
        for _ in 0..3 {
            leases.push(fx.lease(1000).await?);
        }
        let mut loner = fx.lease(1000).await?;
        loner.set_batchable(false);

        let desired = fx.now() + 10_000;
        for lease in &leases {
            fx.manager.manage(lease.clone(), desired)?;
        }
        fx.manager.manage(loner, desired)?;

        time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(fx.manager.len(), 4);
        assert!(fx.batches() >= 1);
        // only the non-batchable lease goes out alone
        assert!(fx.renews() >= 1);
        assert!(fx.renews() <= fx.batches());
        for lease in &leases {
            assert!(fx.manager.get_expiration(lease)? > fx.now());
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batch_failure_isolated() -> Result<(), LeaseError> {
        let fx = Fixture::new(1000, 0, RenewalConfig::default())?;
        let mut leases = vec![];
        for _ in 0..3 {
            leases.push(fx.lease(1000).await?);
        }
        let recorder = Arc::new(Recorder::default());
        let desired = fx.now() + 10_000;
        for lease in &leases {
            fx.manager
                .renew_until(lease.clone(), desired, Some(recorder.clone()))?;
        }
        fx.landlord.cancel(leases[1].cookie()).await?;

        // all three come due at 500 and go out together
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fx.batches(), 1);
        assert_eq!(fx.renews(), 0);
        assert_eq!(fx.manager.len(), 2);
        {
            let failures = recorder.failures.lock().unwrap();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].lease, leases[1]);
            assert_eq!(
                failures[0].error,
                Some(LeaseError::UnknownLease(leases[1].cookie()))
            );
        }
        assert!(fx.manager.get_expiration(&leases[0])? > 1000);
        assert!(fx.manager.get_expiration(&leases[2])? > 1000);
        assert!(fx.manager.get_expiration(&leases[1]).is_err());

        // next round again batches the two survivors
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.batches(), 2);
        assert_eq!(fx.renews(), 0);
        assert_eq!(fx.manager.len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn queued_renewal_stays_within_desired() -> Result<(), LeaseError> {
        let config = RenewalConfig {
            max_inflight_renewals: 1,
            ..Default::default()
        };
        let fx = Fixture::new(1000, 200, config)?;
        let recorder = Arc::new(Recorder::default());
        let desired = fx.now() + 1200;
        for _ in 0..2 {
            let mut lease = fx.lease(1000).await?;
            lease.set_batchable(false);
            fx.manager
                .renew_until(lease, desired, Some(recorder.clone()))?;
        }

        // both due at 500; the second call waits for the first to finish
        time::sleep(Duration::from_millis(1500)).await;
        assert!(fx.manager.is_empty());
        assert_eq!(fx.renews(), 2);
        assert!(recorder.failures.lock().unwrap().is_empty());
        let reached = recorder.reached.lock().unwrap();
        assert_eq!(reached.len(), 2);
        for event in reached.iter() {
            assert_eq!(event.lease.expiration(), desired);
        }
        Ok(())
    }

    /// Listener that re-registers a spare lease from inside its callback.
    struct Rearm {
        manager: LeaseRenewalManager,
        spare: Mutex<Option<Lease>>,
        tracked_at_notify: Mutex<Option<bool>>,
        seen: Mutex<Vec<LeaseRenewalEvent>>,
    }

    impl LeaseListener for Rearm {
        fn notify(&self, event: LeaseRenewalEvent) {
            *self.tracked_at_notify.lock().unwrap() =
                Some(self.manager.get_expiration(&event.lease).is_ok());
            if let Some(spare) = self.spare.lock().unwrap().take() {
                self.manager.manage(spare, FOREVER).unwrap();
            }
            self.seen.lock().unwrap().push(event);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_removes_before_notify() -> Result<(), LeaseError> {
        let fx = Fixture::new(1000, 0, RenewalConfig::default())?;
        let doomed = fx.lease(1000).await?;
        let spare = fx.lease(1000).await?;
        let listener = Arc::new(Rearm {
            manager: fx.manager.clone(),
            spare: Mutex::new(Some(spare.clone())),
            tracked_at_notify: Mutex::new(None),
            seen: Mutex::new(vec![]),
        });
        fx.manager.renew_until(
            doomed.clone(),
            fx.now() + 10_000,
            Some(listener.clone()),
        )?;
        fx.landlord.cancel(doomed.cookie()).await?;

        time::sleep(Duration::from_millis(700)).await;
        {
            let seen = listener.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(
                seen[0].error,
                Some(LeaseError::UnknownLease(doomed.cookie()))
            );
        }
        assert_eq!(*listener.tracked_at_notify.lock().unwrap(), Some(false));
        assert_eq!(fx.manager.len(), 1);
        assert!(fx.manager.get_expiration(&spare).is_ok());
        assert!(fx.manager.get_expiration(&doomed).is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_inflight() -> Result<(), LeaseError> {
        let fx = Fixture::new(1000, 300, RenewalConfig::default())?;
        let lease = fx.lease(1000).await?;
        let recorder = Arc::new(Recorder::default());
        fx.manager.renew_until(
            lease.clone(),
            fx.now() + 10_000,
            Some(recorder.clone()),
        )?;

        // first renewal starts at 500 and answers at 800
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fx.renews(), 1);
        fx.manager.cancel(&lease).await?;
        assert!(fx.manager.is_empty());

        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(fx.renews(), 1);
        assert!(recorder.failures.lock().unwrap().is_empty());
        assert!(fx.landlord.get(lease.cookie()).await.is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_at_manage() -> Result<(), LeaseError> {
        let fx = Fixture::new(1000, 0, RenewalConfig::default())?;
        let lease = fx.lease(1000).await?;
        let stale = Lease::new(
            lease.cookie(),
            fx.now() - 5000,
            lease.landlord().clone(),
            fx.clock.clone(),
        );
        let recorder = Arc::new(Recorder::default());
        fx.manager
            .renew_until(stale, fx.now() + 10_000, Some(recorder.clone()))?;
        assert!(fx.manager.is_empty());
        let failures = recorder.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.as_ref().is_some_and(|e| e.is_unknown()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_fails() -> Result<(), LeaseError> {
        let config = RenewalConfig {
            call_timeout_ms: 200,
            ..Default::default()
        };
        let fx = Fixture::new(1000, 10_000, config)?;
        let lease = fx.lease(1000).await?;
        let recorder = Arc::new(Recorder::default());
        fx.manager
            .renew_until(lease, fx.now() + 10_000, Some(recorder.clone()))?;
        time::sleep(Duration::from_millis(1000)).await;
        assert!(fx.manager.is_empty());
        let failures = recorder.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, Some(LeaseError::Remote(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn set_expiration_and_remove() -> Result<(), LeaseError> {
        let fx = Fixture::new(1000, 0, RenewalConfig::default())?;
        let lease = fx.lease(1000).await?;
        let other = fx.lease(1000).await?;
        fx.manager.manage(lease.clone(), FOREVER)?;
        fx.manager.manage(other.clone(), FOREVER)?;
        fx.manager.set_expiration(&lease, fx.now() + 200)?;

        time::sleep(Duration::from_millis(300)).await;
        assert!(fx.manager.get_expiration(&lease).is_err());
        assert_eq!(fx.renews() + fx.batches(), 0);

        fx.manager.remove(&other)?;
        assert!(fx.manager.remove(&other).is_err());
        assert!(fx.manager.set_expiration(&other, FOREVER).is_err());
        fx.manager.manage(other, FOREVER)?;
        fx.manager.clear();
        assert!(fx.manager.is_empty());
        Ok(())
    }
}
