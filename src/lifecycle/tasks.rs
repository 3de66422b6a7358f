//! Background chain calls and their confirmation handlers.
//!
//! Each task starts with its operation key already reserved. It calls the
//! chain, records COMPLETED or FAILED in the ledger, and applies the result
//! to the prediction record with a compare-and-set update. A failed call is
//! retried under the same key with exponential backoff until the policy's
//! attempt budget runs out, at which point the prediction is marked FAILED.

use super::{Dispatcher, Operation};
use crate::chain::{CreateMarketRequest, CreatedMarket};
use crate::ledger::{LedgerError, OperationStatus};
use crate::mapping::{LifecycleState, MarketOutcomeMeta, Mutation, PredictionRecord};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, error, info, warn};

/// What the creation confirmation found on the record.
enum Confirmation {
    Activated(PredictionRecord),
    /// Ended before the market existed: bind it, then void it.
    Compensate(PredictionRecord),
    AlreadyBound,
    Mismatch(u64),
}

impl Dispatcher {
    /// Drive one reserved operation to COMPLETED, retrying under the same key.
    /// Returns None once the operation is given up on.
    async fn run_reserved<T, E, F, Fut>(&self, op: Operation, external_id: &str, mut call: F) -> Option<T>
    where
        T: Serialize,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = op.key(external_id);
        let mut backoff = self.policy.retry_backoff;

        loop {
            let error = match call().await {
                Ok(value) => {
                    let payload = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
                    if let Err(e) = self.ledger.complete(&key, payload).await {
                        error!(key = %key, error = %e, "chain call succeeded but completion was not recorded");
                    }
                    return Some(value);
                }
                Err(e) => e.to_string(),
            };

            warn!(key = %key, error = %error, "chain call failed");
            if let Err(e) = self.ledger.fail(&key, &error).await {
                error!(key = %key, error = %e, "could not record chain failure");
                return None;
            }

            let attempts = match self.ledger.check(&key).await {
                Ok(record) => record.map(|r| r.attempts).unwrap_or(0),
                Err(e) => {
                    error!(key = %key, error = %e, "could not read operation attempts");
                    return None;
                }
            };
            if attempts >= self.policy.max_chain_attempts {
                self.mark_failed(
                    external_id,
                    &format!("{} failed after {} attempts: {}", op, attempts, error),
                )
                .await;
                return None;
            }

            info!(
                key = %key,
                attempts = attempts,
                backoff_ms = backoff.as_millis() as u64,
                "retrying chain call"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.policy.max_retry_backoff);

            match self.ledger.try_start(&key).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(key = %key, "operation picked up elsewhere, stopping retries");
                    return None;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "could not re-reserve operation");
                    return None;
                }
            }
        }
    }

    pub(super) async fn run_create(&self, external_id: &str) {
        let key = Operation::Create.key(external_id);
        let record = match self.store.get(external_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(external_id = external_id, "prediction expired before market creation");
                if let Err(e) = self.ledger.fail(&key, "prediction record missing").await {
                    error!(key = %key, error = %e, "could not record chain failure");
                }
                return;
            }
            Err(e) => {
                error!(external_id = external_id, error = %e, "could not load prediction for creation");
                if let Err(e) = self.ledger.fail(&key, &e.to_string()).await {
                    error!(key = %key, error = %e, "could not record chain failure");
                }
                return;
            }
        };

        let request = CreateMarketRequest {
            question: record.question.clone(),
            outcomes: record.outcome_titles.clone(),
            close_time: record.locks_at,
            external_ref: record.external_id.clone(),
        };

        let created = self
            .run_reserved(Operation::Create, external_id, || self.chain.create_market(&request))
            .await;
        if let Some(created) = created {
            self.on_market_created(external_id, created.market_id).await;
        }
    }

    /// Bind the confirmed market and continue into any parked transition.
    async fn on_market_created(&self, external_id: &str, market_id: u64) {
        let confirmation = self
            .store
            .update(external_id, |record| {
                if let Some(existing) = record.market_id {
                    return if existing == market_id {
                        Mutation::Keep(Confirmation::AlreadyBound)
                    } else {
                        Mutation::Keep(Confirmation::Mismatch(existing))
                    };
                }
                record.bind_market(market_id);
                if record.lifecycle_state == LifecycleState::Failed {
                    return Mutation::Write(Confirmation::Compensate(record.clone()));
                }
                record.advance(LifecycleState::Active);
                Mutation::Write(Confirmation::Activated(record.clone()))
            })
            .await;

        match confirmation {
            Ok(Some(Confirmation::Activated(record))) => {
                info!(
                    external_id = external_id,
                    market_id = market_id,
                    pending_lock = record.pending_lock,
                    "market confirmed, prediction ACTIVE"
                );
                self.save_outcome_meta(&record, market_id).await;
                if let Err(e) = self
                    .store
                    .refresh_active(&record.channel_id, external_id, self.store.ttls().active_pointer)
                    .await
                {
                    warn!(external_id = external_id, error = %e, "could not extend active pointer");
                }
                if record.pending_lock {
                    info!(external_id = external_id, "running deferred lock");
                    self.continue_with(Operation::Lock, external_id, market_id).await;
                }
            }
            Ok(Some(Confirmation::Compensate(record))) => {
                warn!(
                    external_id = external_id,
                    market_id = market_id,
                    "market confirmed after prediction ended, voiding"
                );
                self.save_outcome_meta(&record, market_id).await;
                self.continue_with(Operation::Void, external_id, market_id).await;
            }
            Ok(Some(Confirmation::AlreadyBound)) => {
                debug!(external_id = external_id, market_id = market_id, "market already bound");
            }
            Ok(Some(Confirmation::Mismatch(existing))) => {
                error!(
                    external_id = external_id,
                    bound = existing,
                    confirmed = market_id,
                    "second market confirmed for one prediction, keeping the first"
                );
            }
            Ok(None) => {
                warn!(
                    external_id = external_id,
                    market_id = market_id,
                    "market confirmed for expired prediction, voiding"
                );
                self.continue_with(Operation::Void, external_id, market_id).await;
            }
            Err(e) => {
                error!(external_id = external_id, market_id = market_id, error = %e, "could not bind market");
            }
        }
    }

    pub(super) async fn save_outcome_meta(&self, record: &PredictionRecord, market_id: u64) {
        let meta = MarketOutcomeMeta {
            market_id,
            outcomes: record.outcome_titles.clone(),
            question: record.question.clone(),
            channel_id: record.channel_id.clone(),
            external_id: record.external_id.clone(),
        };
        if let Err(e) = self.store.put_outcome_meta(&meta).await {
            warn!(market_id = market_id, error = %e, "could not store outcome metadata");
        }
    }

    /// Apply the stored result of a COMPLETED operation to the record again.
    /// Every confirmation handler is a compare-and-set that keeps a record
    /// already past the state it would write, so this is safe to repeat.
    ///
    /// Boxed because the confirmations can submit follow-ups, which lead
    /// back through `reserve_and_spawn`.
    pub(super) fn reapply_completed(
        &self,
        op: Operation,
        external_id: String,
        result: Option<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let this = self.clone();
        Box::pin(async move {
            match op {
                Operation::Create => {
                    let created = result.map(serde_json::from_value::<CreatedMarket>);
                    match created {
                        Some(Ok(created)) => this.on_market_created(&external_id, created.market_id).await,
                        Some(Err(e)) => {
                            error!(external_id = %external_id, error = %e, "stored creation result is unreadable")
                        }
                        None => error!(external_id = %external_id, "completed creation has no stored result"),
                    }
                }
                Operation::Lock => this.apply_locked(&external_id).await,
                Operation::Resolve => this.finish(&external_id, LifecycleState::Resolved).await,
                Operation::Void => this.finish(&external_id, LifecycleState::Voided).await,
            }
        })
    }

    /// Submit a follow-up operation from inside a background task.
    async fn continue_with(&self, op: Operation, external_id: &str, market_id: u64) {
        let submitted = match op {
            Operation::Lock => self.submit_lock(external_id, market_id).await,
            Operation::Void => self.submit_void(external_id, market_id).await,
            Operation::Create | Operation::Resolve => {
                error!(op = %op, "not a follow-up operation");
                return;
            }
        };
        match submitted {
            Ok(outcome) => debug!(external_id = external_id, op = %op, outcome = ?outcome, "follow-up submitted"),
            Err(e) => warn!(external_id = external_id, op = %op, error = %e, "follow-up not submitted"),
        }
    }

    pub(super) async fn run_lock(&self, external_id: &str, market_id: u64) {
        let locked = self
            .run_reserved(Operation::Lock, external_id, || self.chain.lock_market(market_id))
            .await;
        if locked.is_some() {
            self.apply_locked(external_id).await;
        }
    }

    async fn apply_locked(&self, external_id: &str) {
        let applied = self
            .store
            .update(external_id, |record| {
                if record.advance(LifecycleState::Locked) {
                    record.pending_lock = false;
                    Mutation::Write(true)
                } else {
                    Mutation::Keep(false)
                }
            })
            .await;
        match applied {
            Ok(Some(true)) => info!(external_id = external_id, "prediction LOCKED"),
            Ok(_) => debug!(external_id = external_id, "lock confirmation had nothing to advance"),
            Err(e) => error!(external_id = external_id, error = %e, "could not apply lock"),
        }
    }

    /// Lock first if the market is still open, then resolve.
    pub(super) async fn run_resolve(&self, external_id: &str, market_id: u64, winning_outcome: usize) {
        let resolved = self
            .run_reserved(Operation::Resolve, external_id, || async move {
                self.ensure_locked(external_id, market_id).await?;
                self.chain
                    .resolve_market(market_id, winning_outcome)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;
        if resolved.is_some() {
            self.finish(external_id, LifecycleState::Resolved).await;
        }
    }

    /// The implicit lock of an end arriving while ACTIVE. Runs under the same
    /// `lock:` key as a regular lock, so it never duplicates one in flight.
    async fn ensure_locked(&self, external_id: &str, market_id: u64) -> Result<(), String> {
        let state = self
            .store
            .get(external_id)
            .await
            .map_err(|e| e.to_string())?
            .map(|r| r.lifecycle_state);
        if state != Some(LifecycleState::Active) {
            return Ok(());
        }

        let key = Operation::Lock.key(external_id);
        match self
            .ledger
            .with_idempotency(&key, || self.chain.lock_market(market_id))
            .await
        {
            Ok(_) => {
                self.apply_locked(external_id).await;
                Ok(())
            }
            Err(LedgerError::Conflict(_)) => {
                debug!(key = %key, "lock in flight, waiting before resolving");
                let settled = self
                    .ledger
                    .wait_for_settled(&key, self.policy.lock_wait_polls, self.policy.lock_wait_interval)
                    .await
                    .map_err(|e| e.to_string())?;
                match settled {
                    Some(record) if record.status == OperationStatus::Completed => Ok(()),
                    _ => Err(format!("{} did not complete", key)),
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub(super) async fn run_void(&self, external_id: &str, market_id: u64) {
        let voided = self
            .run_reserved(Operation::Void, external_id, || self.chain.void_market(market_id))
            .await;
        if voided.is_some() {
            self.finish(external_id, LifecycleState::Voided).await;
        }
    }

    /// Move to a terminal state and release the channel pointer.
    async fn finish(&self, external_id: &str, terminal: LifecycleState) {
        let channel = self
            .store
            .update(external_id, |record| {
                if record.advance(terminal) {
                    record.pending_lock = false;
                    Mutation::Write(Some(record.channel_id.clone()))
                } else {
                    Mutation::Keep(None)
                }
            })
            .await;

        match channel {
            Ok(Some(Some(channel_id))) => {
                info!(external_id = external_id, state = %terminal, "prediction finished");
                if let Err(e) = self.store.clear_active_if(&channel_id, external_id).await {
                    warn!(channel_id = %channel_id, error = %e, "could not clear active pointer");
                }
            }
            Ok(_) => debug!(external_id = external_id, state = %terminal, "nothing to finish"),
            Err(e) => error!(external_id = external_id, error = %e, "could not finish prediction"),
        }
    }

    /// Give up on a prediction after its attempt budget is spent.
    pub(super) async fn mark_failed(&self, external_id: &str, reason: &str) {
        let channel = self
            .store
            .update(external_id, |record| {
                if record.advance(LifecycleState::Failed) {
                    record.pending_lock = false;
                    record.failure = Some(reason.to_string());
                    Mutation::Write(Some(record.channel_id.clone()))
                } else {
                    Mutation::Keep(None)
                }
            })
            .await;

        match channel {
            Ok(Some(Some(channel_id))) => {
                error!(external_id = external_id, reason = reason, "prediction FAILED");
                if let Err(e) = self.store.clear_active_if(&channel_id, external_id).await {
                    warn!(channel_id = %channel_id, error = %e, "could not clear active pointer");
                }
            }
            Ok(_) => {}
            Err(e) => error!(external_id = external_id, error = %e, "could not mark prediction failed"),
        }
    }
}
