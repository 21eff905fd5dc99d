//! Transaction manager: creates leased transactions, admits participants, and
//! drives them through two-phase commit or abort.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Weak};

use crate::lease::{Landlord, LandlordRef, Lease, LeasePolicy, ResourceLandlord};
use crate::storage::DurableLog;
use crate::txn::{tally, Participant, TxnError, TxnState, Vote};
use crate::utils::{Clock, RiverError, Timer, Uid, UidGenerator};

use futures::future::join_all;

use serde::{Deserialize, Serialize};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnConfig {
    /// Transaction lease duration granted for an `ANY` request, in ms.
    pub default_lease_ms: i64,

    /// Upper bound on a transaction lease, in ms.
    pub max_lease_ms: i64,

    /// Path of the decision log; empty for a volatile manager.
    pub log_path: String,

    /// Maximum number of participant calls in flight per phase.
    pub max_concurrent_calls: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for TxnConfig {
    fn default() -> Self {
        TxnConfig {
            default_lease_ms: 60_000,
            max_lease_ms: 3_600_000,
            log_path: "".into(),
            max_concurrent_calls: 16,
        }
    }
}

impl TxnConfig {
    /// Composes a config from defaults overridden by an optional TOML string.
    pub fn from_config_str(config_str: Option<&str>) -> Result<Self, RiverError> {
        let config = parsed_config!(config_str => TxnConfig;
                                    default_lease_ms, max_lease_ms,
                                    log_path, max_concurrent_calls)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), RiverError> {
        if self.max_concurrent_calls == 0 {
            return logged_err!("max_concurrent_calls must be positive");
        }
        self.lease_policy().validate()
    }

    fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            default_duration_ms: self.default_lease_ms,
            max_duration_ms: self.max_lease_ms,
            deny_over_max: false,
        }
    }
}

/// Decision log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnRecord {
    /// Transaction created under the given lease cookie.
    Created { id: Uid, lease: Uid },

    /// Participant admitted.
    Joined {
        id: Uid,
        participant: Uid,
        crash_count: u64,
    },

    /// Commit decided; the listed participants voted prepared and must be
    /// told to commit.
    Committing { id: Uid, participants: Vec<Uid> },

    /// Abort decided.
    Aborted { id: Uid },

    /// Every participant acknowledged the decision.
    Completed { id: Uid },
}

/// Result of `TxnManager::create()`.
#[derive(Debug, Clone)]
pub struct Created {
    pub id: Uid,

    /// Lease on the transaction; it is aborted if this lapses while ACTIVE.
    pub lease: Lease,
}

/// Outcome of a commit or abort. `failures` lists participants that did not
/// acknowledge the decision; the decision itself stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub state: TxnState,
    pub failures: HashMap<Uid, TxnError>,
}

impl CompletionReport {
    fn new(state: TxnState, failures: HashMap<Uid, TxnError>) -> Self {
        CompletionReport { state, failures }
    }
}

/// Participant list snapshot handed to a completion phase.
type Members = Vec<(Uid, Arc<dyn Participant>)>;

struct Member {
    participant: Arc<dyn Participant>,
    crash_count: u64,
}

struct Txn {
    state: TxnState,
    lease: Uid,
    members: HashMap<Uid, Member>,
}

impl Txn {
    fn transition(&mut self, id: Uid, next: TxnState) {
        debug_assert!(self.state.can_transition_to(next));
        pf_debug!("txn {} {} -> {}", id, self.state, next);
        self.state = next;
    }

    fn snapshot(&self) -> Members {
        self.members
            .iter()
            .map(|(pid, m)| (*pid, m.participant.clone()))
            .collect()
    }
}

/// Transaction state rebuilt from the log.
struct Replayed {
    lease: Uid,
    members: Vec<(Uid, u64)>,
    committing: Option<Vec<Uid>>,
    aborted: bool,
    completed: bool,
}

/// Two-phase commit coordinator. Transactions are leased from the manager's
/// own landlord; participant calls of a phase run concurrently, bounded by
/// `max_concurrent_calls`, and one participant failing never stops the
/// others from hearing the decision.
pub struct TxnManager {
    config: TxnConfig,
    clock: Arc<dyn Clock>,
    uids: Arc<UidGenerator>,

    /// Landlord of transaction leases; the resource is the transaction id.
    leases: Arc<ResourceLandlord<Uid>>,

    txns: Mutex<HashMap<Uid, Txn>>,

    /// Decision log, if durable.
    log: Option<Mutex<DurableLog<TxnRecord>>>,

    calls: Arc<Semaphore>,
}

impl fmt::Debug for TxnManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TxnManager")
            .field("config", &self.config)
            .field("landlord", &self.leases.id())
            .finish()
    }
}

// TxnManager public API implementation
impl TxnManager {
    /// Creates a new transaction manager. A configured log file is started
    /// afresh; use `recover()` to resume from one.
    pub async fn new_and_setup(
        config: TxnConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RiverError> {
        config.validate()?;
        let log = if config.log_path.is_empty() {
            None
        } else {
            let mut log =
                DurableLog::new_and_setup(Path::new(&config.log_path)).await?;
            log.truncate().await?;
            Some(Mutex::new(log))
        };
        Ok(Self::assemble(config, clock, Arc::new(UidGenerator::new()), log))
    }

    /// Rebuilds a manager from its decision log. Transactions with a logged
    /// commit decision but no completion are rolled forward; transactions
    /// that never reached a decision are presumed aborted. `resolver` maps a
    /// participant id back to a live participant.
    pub async fn recover<F>(
        config: TxnConfig,
        clock: Arc<dyn Clock>,
        resolver: F,
    ) -> Result<Self, RiverError>
    where
        F: Fn(Uid) -> Option<Arc<dyn Participant>>,
    {
        config.validate()?;
        if config.log_path.is_empty() {
            return logged_err!("recovery needs a log_path");
        }
        let mut log =
            DurableLog::<TxnRecord>::new_and_setup(Path::new(&config.log_path))
                .await?;
        let records = log.replay().await?;
        pf_info!("replaying {} log records", records.len());

        let uids = Arc::new(UidGenerator::new());
        let mut replayed: HashMap<Uid, Replayed> = HashMap::new();
        for record in records {
            let id = match &record {
                TxnRecord::Created { id, .. }
                | TxnRecord::Joined { id, .. }
                | TxnRecord::Committing { id, .. }
                | TxnRecord::Aborted { id }
                | TxnRecord::Completed { id } => *id,
            };
            uids.mark_in_use(id);
            let txn = replayed.entry(id).or_insert_with(|| Replayed {
                lease: id,
                members: vec![],
                committing: None,
                aborted: false,
                completed: false,
            });
            match record {
                TxnRecord::Created { lease, .. } => {
                    uids.mark_in_use(lease);
                    txn.lease = lease;
                }
                TxnRecord::Joined {
                    participant,
                    crash_count,
                    ..
                } => txn.members.push((participant, crash_count)),
                TxnRecord::Committing { participants, .. } => {
                    txn.committing = Some(participants)
                }
                TxnRecord::Aborted { .. } => txn.aborted = true,
                TxnRecord::Completed { .. } => txn.completed = true,
            }
        }

        let mut manager = Self::assemble(config, clock, uids, Some(Mutex::new(log)));
        let mut txns = HashMap::new();
        for (id, txn) in replayed {
            let resolve = |pids: &mut dyn Iterator<Item = Uid>| -> Members {
                pids.filter_map(|pid| resolver(pid).map(|p| (pid, p)))
                    .collect()
            };

            let state = if txn.completed {
                if txn.aborted {
                    TxnState::Aborted
                } else {
                    TxnState::Committed
                }
            } else if let Some(prepared) = &txn.committing {
                let targets = resolve(&mut prepared.iter().copied());
                let failures = manager
                    .broadcast(id, &targets, move |p| async move {
                        p.commit(id).await
                    })
                    .await;
                if failures.is_empty() && targets.len() == prepared.len() {
                    manager.append(TxnRecord::Completed { id }, false).await?;
                }
                pf_info!(
                    "txn {} rolled forward ({} unfinished)",
                    id,
                    prepared.len() - targets.len() + failures.len()
                );
                TxnState::Committed
            } else if txn.aborted {
                TxnState::Aborted
            } else {
                manager.append(TxnRecord::Aborted { id }, true).await?;
                let targets = resolve(&mut txn.members.iter().map(|(pid, _)| *pid));
                manager.broadcast_abort(id, &targets).await;
                pf_info!("txn {} presumed aborted", id);
                TxnState::Aborted
            };

            let members = txn
                .members
                .iter()
                .filter_map(|&(pid, crash_count)| {
                    resolver(pid).map(|participant| {
                        (
                            pid,
                            Member {
                                participant,
                                crash_count,
                            },
                        )
                    })
                })
                .collect();
            txns.insert(
                id,
                Txn {
                    state,
                    lease: txn.lease,
                    members,
                },
            );
        }

        *manager.txns.get_mut() = txns;
        Ok(manager)
    }

    /// Reference to the landlord of transaction leases.
    pub fn landlord(&self) -> LandlordRef {
        self.leases.landlord_ref()
    }

    /// Creates a transaction leased for (at most) `lease_duration` ms.
    pub async fn create(&self, lease_duration: i64) -> Result<Created, TxnError> {
        let id = self.uids.generate();
        let grant = self.leases.grant(id, lease_duration).await?;
        if let Err(e) = self
            .append(
                TxnRecord::Created {
                    id,
                    lease: grant.cookie,
                },
                false,
            )
            .await
        {
            let _ = self.leases.cancel(grant.cookie).await;
            return Err(TxnError::storage(e));
        }

        self.txns.lock().await.insert(
            id,
            Txn {
                state: TxnState::Active,
                lease: grant.cookie,
                members: HashMap::new(),
            },
        );
        pf_debug!("created txn {} leased for {} ms", id, grant.duration);
        Ok(Created {
            id,
            lease: Lease::from_grant(
                &grant,
                self.leases.landlord_ref(),
                self.clock.clone(),
            ),
        })
    }

    /// Admits a participant. Re-joining with the same crash count is a no-op;
    /// a different crash count means the participant lost its state.
    pub async fn join(
        &self,
        id: Uid,
        participant_id: Uid,
        crash_count: u64,
        participant: Arc<dyn Participant>,
    ) -> Result<(), TxnError> {
        let mut txns = self.txns.lock().await;
        let txn = txns
            .get_mut(&id)
            .ok_or(TxnError::UnknownTransaction(id))?;
        if txn.state != TxnState::Active {
            return Err(TxnError::CannotJoin(format!(
                "transaction {} is {}",
                id, txn.state
            )));
        }
        if !self.lease_live(txn.lease).await {
            return Err(TxnError::CannotJoin(format!(
                "lease of transaction {} expired",
                id
            )));
        }
        if let Some(member) = txn.members.get(&participant_id) {
            if member.crash_count == crash_count {
                return Ok(());
            }
            return Err(TxnError::CannotJoin(format!(
                "participant {} crashed (count {} -> {})",
                participant_id, member.crash_count, crash_count
            )));
        }

        self.append(
            TxnRecord::Joined {
                id,
                participant: participant_id,
                crash_count,
            },
            false,
        )
        .await
        .map_err(TxnError::storage)?;
        txn.members.insert(
            participant_id,
            Member {
                participant,
                crash_count,
            },
        );
        pf_debug!("participant {} joined txn {}", participant_id, id);
        Ok(())
    }

    pub async fn get_state(&self, id: Uid) -> Result<TxnState, TxnError> {
        self.txns
            .lock()
            .await
            .get(&id)
            .map(|txn| txn.state)
            .ok_or(TxnError::UnknownTransaction(id))
    }

    /// Commits the transaction. Fails with `CannotCommit` if voting aborts it
    /// or its lease has lapsed; commit-phase participant failures are
    /// reported without undoing the decision. Committing a committed
    /// transaction again just reports it.
    pub async fn commit(&self, id: Uid) -> Result<CompletionReport, TxnError> {
        let started = {
            let mut txns = self.txns.lock().await;
            let txn = txns
                .get_mut(&id)
                .ok_or(TxnError::UnknownTransaction(id))?;
            match txn.state {
                TxnState::Active => {}
                TxnState::Committed => {
                    return Ok(CompletionReport::new(
                        TxnState::Committed,
                        HashMap::new(),
                    ))
                }
                TxnState::Aborted => {
                    return Err(TxnError::CannotCommit(format!(
                        "transaction {} aborted",
                        id
                    )))
                }
                state => {
                    return Err(TxnError::CannotCommit(format!(
                        "transaction {} is {}",
                        id, state
                    )))
                }
            }
            if self.lease_live(txn.lease).await {
                txn.transition(id, TxnState::Voting);
                Some((txn.lease, txn.snapshot()))
            } else {
                None
            }
        };

        let (lease, members) = match started {
            Some(started) => started,
            None => {
                self.abort(id).await?;
                return Err(TxnError::CannotCommit(format!(
                    "lease of transaction {} expired",
                    id
                )));
            }
        };

        let result = if members.len() == 1 {
            self.complete_single(id, members).await
        } else {
            self.complete_voting(id, members).await
        };
        let _ = self.leases.cancel(lease).await;
        result
    }

    /// Aborts an ACTIVE transaction, telling every participant. Participants
    /// failing to acknowledge are reported; the rest are still told.
    /// Aborting an aborted transaction again just reports it.
    pub async fn abort(&self, id: Uid) -> Result<CompletionReport, TxnError> {
        let (lease, members) = {
            let mut txns = self.txns.lock().await;
            let txn = txns
                .get_mut(&id)
                .ok_or(TxnError::UnknownTransaction(id))?;
            match txn.state {
                TxnState::Active => {}
                TxnState::Aborted => {
                    return Ok(CompletionReport::new(
                        TxnState::Aborted,
                        HashMap::new(),
                    ))
                }
                state => {
                    return Err(TxnError::CannotAbort(format!(
                        "transaction {} is {}",
                        id, state
                    )))
                }
            }
            txn.transition(id, TxnState::Aborted);
            (txn.lease, txn.snapshot())
        };

        let logged = self.append(TxnRecord::Aborted { id }, true).await;
        let failures = self.broadcast_abort(id, &members).await;
        let _ = self.leases.cancel(lease).await;
        pf_info!(
            "txn {} aborted ({} participant failures)",
            id,
            failures.len()
        );
        logged.map_err(TxnError::storage)?;
        Ok(CompletionReport::new(TxnState::Aborted, failures))
    }

    /// Aborts every ACTIVE transaction whose lease has lapsed. Returns their
    /// ids.
    pub async fn expire_stale(&self) -> Vec<Uid> {
        let active: Vec<(Uid, Uid)> = self
            .txns
            .lock()
            .await
            .iter()
            .filter(|(_, txn)| txn.state == TxnState::Active)
            .map(|(id, txn)| (*id, txn.lease))
            .collect();

        let mut expired = vec![];
        for (id, lease) in active {
            if self.lease_live(lease).await {
                continue;
            }
            match self.abort(id).await {
                Ok(_) => {
                    pf_info!("txn {} aborted on lease expiry", id);
                    expired.push(id);
                }
                Err(e) => pf_debug!("txn {} not aborted on expiry: {}", id, e),
            }
        }
        expired
    }

    /// Spawns a task expiring stale transactions and reaping lapsed leases
    /// every `interval`. The task ends once the manager is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            pf_debug!("txn reaper task spawned");
            let mut timer = Timer::new();
            loop {
                if let Err(e) = timer.restart(interval) {
                    pf_error!("error restarting reaper timer: {}", e);
                    break;
                }
                timer.timeout().await;
                match manager.upgrade() {
                    Some(manager) => {
                        manager.expire_stale().await;
                        manager.leases.reap_expired().await;
                    }
                    None => break,
                }
            }
            pf_debug!("txn reaper task exited");
        })
    }

    /// Drops a terminal transaction. Returns false if it is unknown or still
    /// in progress.
    pub async fn forget(&self, id: Uid) -> bool {
        let mut txns = self.txns.lock().await;
        match txns.get(&id) {
            Some(txn) if txn.state.is_terminal() => {
                txns.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Number of transactions held, terminal ones included.
    pub async fn len(&self) -> usize {
        self.txns.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.txns.lock().await.is_empty()
    }
}

// TxnManager completion phases implementation
impl TxnManager {
    fn assemble(
        config: TxnConfig,
        clock: Arc<dyn Clock>,
        uids: Arc<UidGenerator>,
        log: Option<Mutex<DurableLog<TxnRecord>>>,
    ) -> Self {
        let leases = Arc::new(ResourceLandlord::new(
            config.lease_policy(),
            clock.clone(),
            uids.clone(),
        ));
        let calls = Arc::new(Semaphore::new(config.max_concurrent_calls));
        TxnManager {
            config,
            clock,
            uids,
            leases,
            txns: Mutex::new(HashMap::new()),
            log,
            calls,
        }
    }

    async fn lease_live(&self, lease: Uid) -> bool {
        self.leases.get(lease).await.is_some()
    }

    async fn append(&self, record: TxnRecord, sync: bool) -> Result<(), RiverError> {
        if let Some(log) = &self.log {
            log.lock().await.append(&record, sync).await?;
        }
        Ok(())
    }

    async fn set_state(&self, id: Uid, next: TxnState) {
        if let Some(txn) = self.txns.lock().await.get_mut(&id) {
            txn.transition(id, next);
        }
    }

    /// Issues `call` to every member concurrently, at most
    /// `max_concurrent_calls` at a time.
    async fn fan_out<T, F, Fut>(
        &self,
        members: &[(Uid, Arc<dyn Participant>)],
        call: F,
    ) -> Vec<(Uid, Result<T, TxnError>)>
    where
        F: Fn(Arc<dyn Participant>) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        join_all(members.iter().map(|(pid, participant)| {
            let pid = *pid;
            let calls = self.calls.clone();
            let pending = call(participant.clone());
            async move {
                let _permit = calls.acquire_owned().await.ok();
                (pid, pending.await)
            }
        }))
        .await
    }

    /// Like `fan_out()` for acknowledgement-only calls; returns the failures.
    async fn broadcast<F, Fut>(
        &self,
        id: Uid,
        members: &[(Uid, Arc<dyn Participant>)],
        call: F,
    ) -> HashMap<Uid, TxnError>
    where
        F: Fn(Arc<dyn Participant>) -> Fut,
        Fut: Future<Output = Result<(), TxnError>>,
    {
        self.fan_out(members, call)
            .await
            .into_iter()
            .filter_map(|(pid, res)| {
                res.err().map(|e| {
                    pf_warn!("participant {} of txn {} failed: {}", pid, id, e);
                    (pid, e)
                })
            })
            .collect()
    }

    async fn broadcast_abort(
        &self,
        id: Uid,
        members: &[(Uid, Arc<dyn Participant>)],
    ) -> HashMap<Uid, TxnError> {
        self.broadcast(id, members, move |p| async move { p.abort(id).await })
            .await
    }

    /// Completion with exactly one participant through `prepare_and_commit`.
    async fn complete_single(
        &self,
        id: Uid,
        members: Members,
    ) -> Result<CompletionReport, TxnError> {
        let (pid, participant) = match members.into_iter().next() {
            Some(member) => member,
            None => return self.complete_voting(id, vec![]).await,
        };

        let outcome = {
            let _permit = self.calls.clone().acquire_owned().await.ok();
            participant.prepare_and_commit(id).await
        };
        match outcome {
            Ok(TxnState::Committed) => {
                self.set_state(id, TxnState::Prepared).await;
                self.finish_commit(id, HashMap::new()).await
            }
            Ok(TxnState::NotChanged) => {
                self.set_state(id, TxnState::NotChanged).await;
                self.finish_commit(id, HashMap::new()).await
            }
            Ok(state) => {
                pf_debug!("participant {} of txn {} answered {}", pid, id, state);
                self.abort_voting(id, &[]).await
            }
            Err(e) => {
                pf_warn!("participant {} of txn {} failed: {}", pid, id, e);
                self.abort_voting(id, &[(pid, participant)]).await
            }
        }
    }

    /// Two-phase completion: collect votes, decide, then tell every
    /// participant that voted something other than NOTCHANGED.
    async fn complete_voting(
        &self,
        id: Uid,
        members: Members,
    ) -> Result<CompletionReport, TxnError> {
        let votes: HashMap<Uid, Vote> = self
            .fan_out(&members, move |p| async move { p.prepare(id).await })
            .await
            .into_iter()
            .map(|(pid, res)| {
                // a failed prepare counts as an abort vote
                let vote = res.unwrap_or_else(|e| {
                    pf_warn!("prepare of {} in txn {} failed: {}", pid, id, e);
                    Vote::Aborted
                });
                (pid, vote)
            })
            .collect();
        let outcome = tally(votes.values().copied());
        let pending: Members = members
            .into_iter()
            .filter(|(pid, _)| votes.get(pid) != Some(&Vote::NotChanged))
            .collect();

        match outcome {
            TxnState::NotChanged => {
                self.set_state(id, TxnState::NotChanged).await;
                self.finish_commit(id, HashMap::new()).await
            }
            TxnState::Prepared => {
                let decision = TxnRecord::Committing {
                    id,
                    participants: pending.iter().map(|(pid, _)| *pid).collect(),
                };
                if let Err(e) = self.append(decision, true).await {
                    // an unlogged commit decision must not stand
                    pf_error!("error logging commit of txn {}: {}", id, e);
                    let _ = self.abort_voting(id, &pending).await;
                    return Err(TxnError::storage(e));
                }
                self.set_state(id, TxnState::Prepared).await;
                let failures = self
                    .broadcast(id, &pending, move |p| async move {
                        p.commit(id).await
                    })
                    .await;
                self.finish_commit(id, failures).await
            }
            _ => self.abort_voting(id, &pending).await,
        }
    }

    /// Moves a PREPARED or NOTCHANGED transaction to COMMITTED.
    async fn finish_commit(
        &self,
        id: Uid,
        failures: HashMap<Uid, TxnError>,
    ) -> Result<CompletionReport, TxnError> {
        self.set_state(id, TxnState::Committed).await;
        if failures.is_empty() {
            // roll-forward still covers the transaction if this is lost
            if let Err(e) = self.append(TxnRecord::Completed { id }, false).await {
                pf_error!("error logging completion of txn {}: {}", id, e);
            }
        }
        pf_info!(
            "txn {} committed ({} participant failures)",
            id,
            failures.len()
        );
        Ok(CompletionReport::new(TxnState::Committed, failures))
    }

    /// Aborts a transaction during VOTING, telling the given participants.
    async fn abort_voting(
        &self,
        id: Uid,
        pending: &[(Uid, Arc<dyn Participant>)],
    ) -> Result<CompletionReport, TxnError> {
        self.set_state(id, TxnState::Aborted).await;
        let logged = self.append(TxnRecord::Aborted { id }, true).await;
        let failures = self.broadcast_abort(id, pending).await;
        pf_info!(
            "txn {} aborted in voting ({} participant failures)",
            id,
            failures.len()
        );
        logged.map_err(TxnError::storage)?;
        Err(TxnError::CannotCommit(format!(
            "transaction {} aborted during voting",
            id
        )))
    }
}
