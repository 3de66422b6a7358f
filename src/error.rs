//! Error taxonomy surfaced by the event dispatcher.
//!
//! Replaying a COMPLETED operation is not an error; it surfaces as
//! `lifecycle::Dispatch::Duplicate`.

use crate::ledger::LedgerError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// The notification failed HMAC verification. Nothing was mutated.
    #[error("invalid webhook signature")]
    SignatureInvalid,
    /// A non-begin notification named a prediction with no record.
    #[error("no record for prediction {0}")]
    UnknownPrediction(String),
    /// Another reservation for this operation is still PENDING.
    #[error("operation {0} is already in flight")]
    OperationConflict(String),
    #[error("chain call {key} failed: {error}")]
    ChainCallFailed { key: String, error: String },
    /// The store could not durably record a reservation or state change.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("ledger inconsistency: {0}")]
    Ledger(String),
}

impl From<LedgerError> for BridgeError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Conflict(key) => BridgeError::OperationConflict(key),
            LedgerError::Operation { key, error } => BridgeError::ChainCallFailed { key, error },
            LedgerError::Store(e) => BridgeError::StoreUnavailable(e),
            LedgerError::Serialization(e) => BridgeError::StoreUnavailable(StoreError::Serialization(e)),
            e @ LedgerError::InvalidTransition { .. } => BridgeError::Ledger(e.to_string()),
        }
    }
}
