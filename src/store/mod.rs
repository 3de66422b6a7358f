//! Keyed store arena shared by every bridge replica.
//!
//! The ledger and the mapping store never coordinate through process-local
//! locks. Everything goes through this small compare-and-set surface over
//! string keys, which Valkey provides across replicas and [`MemoryStore`]
//! reproduces for tests and single-node runs.
//!
//! Key layout (all under the configured prefix, default "bridge"):
//!   prediction:{external_id}   → JSON PredictionRecord   (TTL: pending / record)
//!   active:{channel_id}        → external_id             (TTL: active pointer)
//!   market_meta:{market_id}    → JSON MarketOutcomeMeta  (TTL: 30d)
//!   op:{operation_key}         → JSON OperationRecord    (TTL: per status)

mod memory;
mod valkey;

pub use memory::MemoryStore;
pub use valkey::ValkeyStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("valkey error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("key {0} stayed contended after {1} compare-and-set attempts")]
    Contended(String, usize),
}

/// Linearizable single-key operations with expiry.
///
/// Every write carries a TTL; an expired key reads as absent and counts as
/// absent for the conditional writes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write only if the key is absent or expired. Returns whether it wrote.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Replace the value only if it still equals `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove the key only if it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), StoreError>;
}
