//! Prediction lifecycle state machine.
//!
//! Consumes verified notifications and drives each prediction through
//! PENDING → ACTIVE → LOCKED → RESOLVED | VOIDED (FAILED from anywhere on an
//! unrecoverable chain error).
//!
//! - begin: create the record (first delivery only), point the channel at
//!   it, reserve `create:<id>` and submit market creation.
//! - progress: refresh outcome titles; never changes state.
//! - lock: reserve `lock:<id>` once the market is ACTIVE. If creation has not
//!   confirmed yet the lock is parked on the record (`pending_lock`) and the
//!   creation confirmation picks it up.
//! - end: reserve `resolve:<id>` or `void:<id>`.
//!
//! Handlers return as soon as a reservation is durable. Chain calls run as
//! detached tasks (see `tasks.rs`) that write their outcome back to the
//! ledger and the record. Cross-replica safety comes only from the ledger's
//! reservations and single-key compare-and-set on records.

mod tasks;

use crate::chain::MarketChain;
use crate::error::BridgeError;
use crate::ledger::{IdempotencyLedger, OperationStatus};
use crate::mapping::{LifecycleState, Mutation, PredictionRecord, PredictionStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// One upstream outcome as announced.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamOutcome {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginEvent {
    pub external_id: String,
    pub channel_id: String,
    pub title: String,
    pub outcomes: Vec<UpstreamOutcome>,
    pub locks_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub external_id: String,
    pub outcomes: Vec<UpstreamOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockEvent {
    pub external_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStatus {
    Resolved,
    Canceled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndEvent {
    pub external_id: String,
    pub status: EndStatus,
    /// Upstream outcome id; set when `status` is Resolved.
    pub winning_outcome_id: Option<String>,
}

/// A verified prediction notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionEvent {
    Begin(BeginEvent),
    Progress(ProgressEvent),
    Lock(LockEvent),
    End(EndEvent),
}

impl PredictionEvent {
    pub fn external_id(&self) -> &str {
        match self {
            PredictionEvent::Begin(e) => &e.external_id,
            PredictionEvent::Progress(e) => &e.external_id,
            PredictionEvent::Lock(e) => &e.external_id,
            PredictionEvent::End(e) => &e.external_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PredictionEvent::Begin(_) => "begin",
            PredictionEvent::Progress(_) => "progress",
            PredictionEvent::Lock(_) => "lock",
            PredictionEvent::End(_) => "end",
        }
    }
}

/// A side-effecting chain operation, one ledger key per prediction each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Lock,
    Resolve,
    Void,
}

impl Operation {
    pub fn key(self, external_id: &str) -> String {
        format!("{}:{}", self, external_id)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Lock => write!(f, "lock"),
            Operation::Resolve => write!(f, "resolve"),
            Operation::Void => write!(f, "void"),
        }
    }
}

/// What a handler did with a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Reservation taken; the chain call runs in the background.
    Submitted(Operation),
    /// Lock parked until market creation confirms.
    Deferred,
    /// Display metadata refreshed.
    Refreshed,
    /// Already handled, or already reserved and completed.
    Duplicate,
    /// Dropped: regression, advisory event for a missing record, or bad input.
    Ignored,
    /// The prediction ended before its market existed; record is FAILED.
    MarkedFailed,
}

/// Retry and wait limits for background chain calls.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    /// Reservations per operation key before the prediction is marked FAILED.
    pub max_chain_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    /// How long a resolution waits on an in-flight lock.
    pub lock_wait_polls: u32,
    pub lock_wait_interval: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_chain_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            max_retry_backoff: Duration::from_secs(60),
            lock_wait_polls: 30,
            lock_wait_interval: Duration::from_secs(1),
        }
    }
}

/// What `lock` decided under the record's compare-and-set.
enum LockPlan {
    Submit(u64),
    Deferred,
    AlreadyDeferred,
    Stale(LifecycleState),
}

/// What `end` decided under the record's compare-and-set.
enum EndPlan {
    Resolve { market_id: u64, winning_outcome: usize },
    Void { market_id: u64 },
    FailedBeforeConfirm { channel_id: String },
    Stale(LifecycleState),
}

#[derive(Clone)]
pub struct Dispatcher {
    store: PredictionStore,
    ledger: IdempotencyLedger,
    chain: Arc<dyn MarketChain>,
    policy: DispatchPolicy,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        store: PredictionStore,
        ledger: IdempotencyLedger,
        chain: Arc<dyn MarketChain>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            chain,
            policy,
            tasks: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &PredictionStore {
        &self.store
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Route one verified notification.
    pub async fn handle(&self, event: PredictionEvent) -> Result<Dispatch, BridgeError> {
        debug!(kind = event.kind(), external_id = event.external_id(), "dispatching");
        match event {
            PredictionEvent::Begin(e) => self.on_begin(e).await,
            PredictionEvent::Progress(e) => self.on_progress(e).await,
            PredictionEvent::Lock(e) => self.on_lock(e).await,
            PredictionEvent::End(e) => self.on_end(e).await,
        }
    }

    /// Wait for every background chain task, including ones they spawn.
    /// Test harness hook; production code drains with `shutdown`.
    #[doc(hidden)]
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Drain in-flight chain calls before exit.
    pub async fn shutdown(&self) {
        info!(in_flight = self.tasks.len(), "draining background chain tasks");
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn on_begin(&self, event: BeginEvent) -> Result<Dispatch, BridgeError> {
        let now = Utc::now();
        let record = PredictionRecord {
            external_id: event.external_id.clone(),
            channel_id: event.channel_id.clone(),
            market_id: None,
            question: event.title,
            outcome_titles: event.outcomes.iter().map(|o| o.title.clone()).collect(),
            outcome_index_map: event
                .outcomes
                .iter()
                .enumerate()
                .map(|(i, o)| (o.id.clone(), i))
                .collect::<HashMap<_, _>>(),
            locks_at: event.locks_at,
            created_at: now,
            updated_at: now,
            lifecycle_state: LifecycleState::Pending,
            pending_lock: false,
            winning_outcome: None,
            failure: None,
        };

        if self.store.insert_new(&record).await? {
            self.store
                .set_active(&record.channel_id, &record.external_id, self.store.ttls().pending)
                .await?;
            info!(
                external_id = %record.external_id,
                channel_id = %record.channel_id,
                outcomes = record.outcome_titles.len(),
                "prediction opened"
            );
        } else {
            // Redelivery. Only an unconfirmed record gets another creation
            // attempt, and the ledger decides whether that is allowed.
            match self.store.get(&record.external_id).await? {
                Some(existing)
                    if existing.market_id.is_none()
                        && existing.lifecycle_state == LifecycleState::Pending =>
                {
                    // The first delivery may have stored the record but not
                    // the pointer. Never displace a newer prediction.
                    if self
                        .store
                        .claim_active(&existing.channel_id, &existing.external_id, self.store.ttls().pending)
                        .await?
                    {
                        info!(
                            external_id = %existing.external_id,
                            channel_id = %existing.channel_id,
                            "active pointer restored on redelivery"
                        );
                    }
                }
                _ => {
                    debug!(external_id = %record.external_id, "duplicate begin absorbed");
                    return Ok(Dispatch::Duplicate);
                }
            }
        }

        self.reserve_and_spawn(Operation::Create, &record.external_id, {
            let this = self.clone();
            let external_id = record.external_id.clone();
            move || async move { this.run_create(&external_id).await }
        })
        .await
    }

    async fn on_progress(&self, event: ProgressEvent) -> Result<Dispatch, BridgeError> {
        let updated = self
            .store
            .update(&event.external_id, |record| {
                if record.lifecycle_state.is_terminal() {
                    return Mutation::Keep(None);
                }
                let mut titles = record.outcome_titles.clone();
                for outcome in &event.outcomes {
                    if let Some(i) = record.outcome_index(&outcome.id) {
                        if let Some(slot) = titles.get_mut(i) {
                            *slot = outcome.title.clone();
                        }
                    }
                }
                if titles == record.outcome_titles {
                    return Mutation::Keep(None);
                }
                record.outcome_titles = titles;
                record.updated_at = Utc::now();
                Mutation::Write(Some(record.clone()))
            })
            .await?;

        match updated {
            Some(Some(record)) => {
                if let Some(market_id) = record.market_id {
                    self.save_outcome_meta(&record, market_id).await;
                }
                Ok(Dispatch::Refreshed)
            }
            Some(None) => Ok(Dispatch::Duplicate),
            // Advisory only; nothing to refresh
            None => Ok(Dispatch::Ignored),
        }
    }

    async fn on_lock(&self, event: LockEvent) -> Result<Dispatch, BridgeError> {
        let external_id = event.external_id;
        let plan = self
            .store
            .update(&external_id, |record| match (record.lifecycle_state, record.market_id) {
                (LifecycleState::Active, Some(market_id)) => Mutation::Keep(LockPlan::Submit(market_id)),
                (LifecycleState::Pending, None) if record.pending_lock => {
                    Mutation::Keep(LockPlan::AlreadyDeferred)
                }
                (LifecycleState::Pending, None) => {
                    record.pending_lock = true;
                    record.updated_at = Utc::now();
                    Mutation::Write(LockPlan::Deferred)
                }
                (state, _) => Mutation::Keep(LockPlan::Stale(state)),
            })
            .await?;

        match plan {
            None => {
                warn!(external_id = %external_id, "lock for unknown prediction dropped");
                Err(BridgeError::UnknownPrediction(external_id))
            }
            Some(LockPlan::Submit(market_id)) => self.submit_lock(&external_id, market_id).await,
            Some(LockPlan::Deferred) => {
                info!(external_id = %external_id, "lock arrived before market confirmation, deferred");
                Ok(Dispatch::Deferred)
            }
            Some(LockPlan::AlreadyDeferred) => Ok(Dispatch::Duplicate),
            Some(LockPlan::Stale(state)) => {
                warn!(external_id = %external_id, state = %state, "lock would regress lifecycle, dropped");
                Ok(Dispatch::Ignored)
            }
        }
    }

    async fn on_end(&self, event: EndEvent) -> Result<Dispatch, BridgeError> {
        let external_id = event.external_id;
        let Some(record) = self.store.get(&external_id).await? else {
            warn!(external_id = %external_id, "end for unknown prediction dropped");
            return Err(BridgeError::UnknownPrediction(external_id));
        };

        let winning_outcome = match event.status {
            EndStatus::Canceled => None,
            EndStatus::Resolved => {
                let index = event
                    .winning_outcome_id
                    .as_deref()
                    .and_then(|id| record.outcome_index(id));
                if index.is_none() {
                    warn!(
                        external_id = %external_id,
                        winning_outcome_id = ?event.winning_outcome_id,
                        "resolved end names no known outcome, dropped"
                    );
                    return Ok(Dispatch::Ignored);
                }
                index
            }
        };

        let plan = self
            .store
            .update(&external_id, |record| {
                let state = record.lifecycle_state;
                if state.is_terminal() {
                    return Mutation::Keep(EndPlan::Stale(state));
                }
                match (record.market_id, winning_outcome) {
                    (None, _) => {
                        record.advance(LifecycleState::Failed);
                        record.pending_lock = false;
                        record.failure = Some("ended before market confirmation".to_string());
                        Mutation::Write(EndPlan::FailedBeforeConfirm {
                            channel_id: record.channel_id.clone(),
                        })
                    }
                    (Some(market_id), Some(index)) => {
                        // First resolution wins; redeliveries reuse it
                        if let Some(recorded) = record.winning_outcome {
                            return Mutation::Keep(EndPlan::Resolve {
                                market_id,
                                winning_outcome: recorded,
                            });
                        }
                        record.winning_outcome = Some(index);
                        record.updated_at = Utc::now();
                        Mutation::Write(EndPlan::Resolve {
                            market_id,
                            winning_outcome: index,
                        })
                    }
                    (Some(market_id), None) => Mutation::Keep(EndPlan::Void { market_id }),
                }
            })
            .await?;

        match plan {
            None => Err(BridgeError::UnknownPrediction(external_id)),
            Some(EndPlan::Stale(state)) => {
                warn!(external_id = %external_id, state = %state, "end for finished prediction dropped");
                Ok(Dispatch::Ignored)
            }
            Some(EndPlan::FailedBeforeConfirm { channel_id }) => {
                warn!(
                    external_id = %external_id,
                    "prediction ended before its market was confirmed, marked FAILED"
                );
                self.store.clear_active_if(&channel_id, &external_id).await?;
                Ok(Dispatch::MarkedFailed)
            }
            Some(EndPlan::Resolve {
                market_id,
                winning_outcome,
            }) => {
                if self.ledger.check(&Operation::Void.key(&external_id)).await?.is_some() {
                    warn!(external_id = %external_id, "resolution after void was submitted, dropped");
                    return Ok(Dispatch::Ignored);
                }
                self.reserve_and_spawn(Operation::Resolve, &external_id, {
                    let this = self.clone();
                    let external_id = external_id.clone();
                    move || async move {
                        this.run_resolve(&external_id, market_id, winning_outcome).await
                    }
                })
                .await
            }
            Some(EndPlan::Void { market_id }) => {
                if self.ledger.check(&Operation::Resolve.key(&external_id)).await?.is_some() {
                    warn!(external_id = %external_id, "cancel after resolution was submitted, dropped");
                    return Ok(Dispatch::Ignored);
                }
                self.submit_void(&external_id, market_id).await
            }
        }
    }

    async fn submit_lock(&self, external_id: &str, market_id: u64) -> Result<Dispatch, BridgeError> {
        self.reserve_and_spawn(Operation::Lock, external_id, {
            let this = self.clone();
            let external_id = external_id.to_string();
            move || async move { this.run_lock(&external_id, market_id).await }
        })
        .await
    }

    async fn submit_void(&self, external_id: &str, market_id: u64) -> Result<Dispatch, BridgeError> {
        self.reserve_and_spawn(Operation::Void, external_id, {
            let this = self.clone();
            let external_id = external_id.to_string();
            move || async move { this.run_void(&external_id, market_id).await }
        })
        .await
    }

    /// Reserve the operation key and, only if this caller won it, detach the
    /// chain call. The reservation is durable before this returns.
    async fn reserve_and_spawn<F, Fut>(
        &self,
        op: Operation,
        external_id: &str,
        task: F,
    ) -> Result<Dispatch, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let key = op.key(external_id);
        if self.ledger.try_start(&key).await? {
            info!(key = %key, "operation reserved, submitting to chain");
            self.tasks.spawn(task());
            return Ok(Dispatch::Submitted(op));
        }

        match self.ledger.check(&key).await? {
            Some(record) if record.status == OperationStatus::Pending => {
                debug!(key = %key, "operation already in flight");
                Err(BridgeError::OperationConflict(key))
            }
            Some(record) if record.status == OperationStatus::Completed => {
                // The chain call landed but its write-back may not have.
                // Re-applying is a no-op when it did.
                debug!(key = %key, "operation already completed, re-applying its result");
                self.tasks
                    .spawn(self.reapply_completed(op, external_id.to_string(), record.result));
                Ok(Dispatch::Duplicate)
            }
            _ => {
                debug!(key = %key, "operation already settled");
                Ok(Dispatch::Duplicate)
            }
        }
    }
}
