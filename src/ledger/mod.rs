//! Idempotency ledger: store-backed "run at most once" per operation key.
//!
//! Operation keys name one logical side effect, e.g. `create:<external_id>`.
//! A key moves absent → PENDING (reserved) → COMPLETED | FAILED. FAILED keys
//! can be reserved again, COMPLETED keys replay their stored result until
//! they expire. PENDING reservations expire too, so a replica that dies
//! mid-call does not wedge the key forever.

use crate::store::{KeyValueStore, StoreError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on compare-and-set retries for one status transition.
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "PENDING"),
            OperationStatus::Completed => write!(f, "COMPLETED"),
            OperationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub key: String,
    pub status: OperationStatus,
    pub timestamp: DateTime<Utc>,
    /// Present iff COMPLETED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Present iff FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reservations taken on this key, including the current one.
    #[serde(default)]
    pub attempts: u32,
}

impl OperationRecord {
    fn pending(key: &str, attempts: u32) -> Self {
        Self {
            key: key.to_string(),
            status: OperationStatus::Pending,
            timestamp: Utc::now(),
            result: None,
            error: None,
            attempts,
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Another reservation for this key is in flight.
    #[error("operation {0} is already in progress")]
    Conflict(String),
    #[error("operation {key} failed: {error}")]
    Operation { key: String, error: String },
    #[error("operation {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of [`IdempotencyLedger::with_idempotency`].
#[derive(Debug, Clone, PartialEq)]
pub enum Execution<T> {
    /// The operation ran in this call.
    Executed(T),
    /// The key was already COMPLETED; this is the stored result.
    Replayed(T),
}

impl<T> Execution<T> {
    pub fn into_inner(self) -> T {
        match self {
            Execution::Executed(v) | Execution::Replayed(v) => v,
        }
    }

    pub fn was_replayed(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }
}

/// Retention per status.
#[derive(Debug, Clone, Copy)]
pub struct LedgerTtls {
    pub pending: Duration,
    pub completed: Duration,
    pub failed: Duration,
}

impl Default for LedgerTtls {
    fn default() -> Self {
        Self {
            pending: Duration::from_secs(15 * 60),
            completed: Duration::from_secs(7 * 86_400),
            failed: Duration::from_secs(86_400),
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn KeyValueStore>,
    ttls: LedgerTtls,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn KeyValueStore>, ttls: LedgerTtls) -> Self {
        Self { store, ttls }
    }

    fn store_key(key: &str) -> String {
        format!("op:{}", key)
    }

    async fn load(&self, key: &str) -> Result<Option<(String, OperationRecord)>, LedgerError> {
        match self.store.get(&Self::store_key(key)).await? {
            Some(raw) => {
                let record = serde_json::from_str(&raw)?;
                Ok(Some((raw, record)))
            }
            None => Ok(None),
        }
    }

    /// Reserve `key`. True only for the caller that moved it from
    /// absent/expired/FAILED to PENDING.
    pub async fn try_start(&self, key: &str) -> Result<bool, LedgerError> {
        let store_key = Self::store_key(key);
        let reserved = match self.load(key).await? {
            None => {
                let json = serde_json::to_string(&OperationRecord::pending(key, 1))?;
                self.store
                    .set_if_absent(&store_key, &json, self.ttls.pending)
                    .await?
            }
            Some((raw, current)) => match current.status {
                OperationStatus::Pending | OperationStatus::Completed => false,
                OperationStatus::Failed => {
                    let next = OperationRecord::pending(key, current.attempts.saturating_add(1));
                    let json = serde_json::to_string(&next)?;
                    self.store
                        .compare_and_swap(&store_key, &raw, &json, self.ttls.pending)
                        .await?
                }
            },
        };
        debug!(key = key, reserved = reserved, "ledger reservation");
        Ok(reserved)
    }

    /// PENDING → COMPLETED with `result`.
    pub async fn complete(&self, key: &str, result: serde_json::Value) -> Result<(), LedgerError> {
        self.transition(key, OperationStatus::Completed, |attempts| OperationRecord {
            key: key.to_string(),
            status: OperationStatus::Completed,
            timestamp: Utc::now(),
            result: Some(result.clone()),
            error: None,
            attempts,
        })
        .await
    }

    /// PENDING → FAILED. The key becomes reservable again.
    pub async fn fail(&self, key: &str, error: &str) -> Result<(), LedgerError> {
        self.transition(key, OperationStatus::Failed, |attempts| OperationRecord {
            key: key.to_string(),
            status: OperationStatus::Failed,
            timestamp: Utc::now(),
            result: None,
            error: Some(error.to_string()),
            attempts,
        })
        .await
    }

    pub async fn check(&self, key: &str) -> Result<Option<OperationRecord>, LedgerError> {
        Ok(self.load(key).await?.map(|(_, record)| record))
    }

    async fn transition<F>(&self, key: &str, to: OperationStatus, build: F) -> Result<(), LedgerError>
    where
        F: Fn(u32) -> OperationRecord,
    {
        let store_key = Self::store_key(key);
        let ttl = match to {
            OperationStatus::Completed => self.ttls.completed,
            OperationStatus::Failed => self.ttls.failed,
            OperationStatus::Pending => self.ttls.pending,
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let written = match self.load(key).await? {
                // The reservation outlived its TTL. Record the outcome anyway
                // so a late retry does not repeat the side effect.
                None => {
                    warn!(key = key, status = %to, "reservation expired before outcome was recorded");
                    let json = serde_json::to_string(&build(1))?;
                    self.store.set_if_absent(&store_key, &json, ttl).await?
                }
                Some((raw, current)) => match current.status {
                    OperationStatus::Pending => {
                        let json = serde_json::to_string(&build(current.attempts))?;
                        self.store
                            .compare_and_swap(&store_key, &raw, &json, ttl)
                            .await?
                    }
                    status if status == to => return Ok(()),
                    from => {
                        return Err(LedgerError::InvalidTransition {
                            key: key.to_string(),
                            from,
                            to,
                        })
                    }
                },
            };
            if written {
                debug!(key = key, status = %to, "ledger transition");
                return Ok(());
            }
        }
        Err(StoreError::Contended(key.to_string(), MAX_CAS_ATTEMPTS).into())
    }

    /// Run `operation` at most once for `key`.
    ///
    /// COMPLETED replays the stored result without calling `operation`.
    /// PENDING (or losing the reservation race) is a [`LedgerError::Conflict`].
    /// Otherwise the key is reserved, the operation runs, and its outcome is
    /// recorded.
    pub async fn with_idempotency<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<Execution<T>, LedgerError>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(existing) = self.check(key).await? {
            match existing.status {
                OperationStatus::Completed => {
                    let cached = existing.result.unwrap_or(serde_json::Value::Null);
                    debug!(key = key, "replaying completed operation");
                    return Ok(Execution::Replayed(serde_json::from_value(cached)?));
                }
                OperationStatus::Pending => return Err(LedgerError::Conflict(key.to_string())),
                OperationStatus::Failed => {}
            }
        }

        if !self.try_start(key).await? {
            return Err(LedgerError::Conflict(key.to_string()));
        }

        match operation().await {
            Ok(value) => {
                self.complete(key, serde_json::to_value(&value)?).await?;
                Ok(Execution::Executed(value))
            }
            Err(e) => {
                let error = e.to_string();
                self.fail(key, &error).await?;
                Err(LedgerError::Operation {
                    key: key.to_string(),
                    error,
                })
            }
        }
    }

    /// Poll until `key` leaves PENDING, for at most `polls` checks.
    /// Returns the last record seen.
    pub async fn wait_for_settled(
        &self,
        key: &str,
        polls: u32,
        interval: Duration,
    ) -> Result<Option<OperationRecord>, LedgerError> {
        let mut last = self.check(key).await?;
        for _ in 0..polls {
            match &last {
                Some(record) if record.status == OperationStatus::Pending => {
                    tokio::time::sleep(interval).await;
                    last = self.check(key).await?;
                }
                _ => break,
            }
        }
        if let Some(record) = &last {
            info!(key = key, status = %record.status, "waited on operation");
        }
        Ok(last)
    }
}
