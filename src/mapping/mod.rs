//! Prediction ↔ market mapping store.
//!
//! Holds one [`PredictionRecord`] per upstream prediction, a per-channel
//! pointer to the prediction that is live right now, and outcome titles per
//! on-chain market (kept longer so finished markets still render).
//!
//! Every operation touches one key. There are no multi-key transactions: the
//! record is always written before the pointer that names it, and the pointer
//! is cleared before the record is deleted.

use crate::store::{KeyValueStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on compare-and-set retries for one record update.
const MAX_UPDATE_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Pending,
    Active,
    Locked,
    Resolved,
    Voided,
    Failed,
}

impl LifecycleState {
    /// Position along pending → active → locked → terminal.
    fn rank(self) -> u8 {
        match self {
            LifecycleState::Pending => 0,
            LifecycleState::Active => 1,
            LifecycleState::Locked => 2,
            LifecycleState::Resolved | LifecycleState::Voided | LifecycleState::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether moving to `next` keeps the lifecycle monotonic. FAILED is
    /// reachable from every non-terminal state.
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == LifecycleState::Failed || next.rank() > self.rank()
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Pending => write!(f, "PENDING"),
            LifecycleState::Active => write!(f, "ACTIVE"),
            LifecycleState::Locked => write!(f, "LOCKED"),
            LifecycleState::Resolved => write!(f, "RESOLVED"),
            LifecycleState::Voided => write!(f, "VOIDED"),
            LifecycleState::Failed => write!(f, "FAILED"),
        }
    }
}

/// One upstream prediction bound to (at most) one on-chain market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub external_id: String,
    pub channel_id: String,
    /// Null until the chain confirms creation; never changes once set.
    pub market_id: Option<u64>,
    pub question: String,
    pub outcome_titles: Vec<String>,
    /// Upstream outcome id → local outcome index.
    pub outcome_index_map: HashMap<String, usize>,
    pub locks_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lifecycle_state: LifecycleState,
    /// A lock arrived before the market id was known.
    #[serde(default)]
    pub pending_lock: bool,
    #[serde(default)]
    pub winning_outcome: Option<usize>,
    #[serde(default)]
    pub failure: Option<String>,
}

impl PredictionRecord {
    pub fn outcome_index(&self, upstream_outcome_id: &str) -> Option<usize> {
        self.outcome_index_map.get(upstream_outcome_id).copied()
    }

    /// Move to `next` if that keeps the lifecycle monotonic.
    pub fn advance(&mut self, next: LifecycleState) -> bool {
        if !self.lifecycle_state.can_advance_to(next) {
            return false;
        }
        self.lifecycle_state = next;
        self.updated_at = Utc::now();
        true
    }

    /// Bind the confirmed market id. Only the first binding sticks.
    pub fn bind_market(&mut self, market_id: u64) -> bool {
        if self.market_id.is_some() {
            return false;
        }
        self.market_id = Some(market_id);
        self.updated_at = Utc::now();
        true
    }
}

/// Outcome titles for a market, kept beyond the prediction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOutcomeMeta {
    pub market_id: u64,
    pub outcomes: Vec<String>,
    pub question: String,
    pub channel_id: String,
    pub external_id: String,
}

/// What an update closure decided.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Persist the modified record.
    Write(T),
    /// Leave the stored record untouched.
    Keep(T),
}

#[derive(Debug, Clone, Copy)]
pub struct MappingTtls {
    /// Window for the chain to confirm creation, measured from `created_at`.
    pub pending: Duration,
    /// Retention for records once a market is bound.
    pub record: Duration,
    pub active_pointer: Duration,
    pub outcome_meta: Duration,
}

impl Default for MappingTtls {
    fn default() -> Self {
        Self {
            pending: Duration::from_secs(30 * 60),
            record: Duration::from_secs(2 * 86_400),
            active_pointer: Duration::from_secs(86_400),
            outcome_meta: Duration::from_secs(30 * 86_400),
        }
    }
}

#[derive(Clone)]
pub struct PredictionStore {
    store: Arc<dyn KeyValueStore>,
    ttls: MappingTtls,
}

impl PredictionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttls: MappingTtls) -> Self {
        Self { store, ttls }
    }

    pub fn ttls(&self) -> &MappingTtls {
        &self.ttls
    }

    fn record_key(external_id: &str) -> String {
        format!("prediction:{}", external_id)
    }

    fn active_key(channel_id: &str) -> String {
        format!("active:{}", channel_id)
    }

    fn meta_key(market_id: u64) -> String {
        format!("market_meta:{}", market_id)
    }

    /// Unconfirmed records only live for what is left of the pending window.
    fn ttl_for(&self, record: &PredictionRecord) -> Duration {
        if record.market_id.is_none() && record.lifecycle_state == LifecycleState::Pending {
            let age = (Utc::now() - record.created_at).to_std().unwrap_or_default();
            return self
                .ttls
                .pending
                .saturating_sub(age)
                .max(Duration::from_millis(1));
        }
        self.ttls.record
    }

    // --- Records ---

    /// Create the record unless one already exists. Returns whether it wrote.
    pub async fn insert_new(&self, record: &PredictionRecord) -> Result<bool, StoreError> {
        let json = serde_json::to_string(record)?;
        let created = self
            .store
            .set_if_absent(
                &Self::record_key(&record.external_id),
                &json,
                self.ttl_for(record),
            )
            .await?;
        debug!(external_id = %record.external_id, created = created, "insert prediction");
        Ok(created)
    }

    /// Unconditional write.
    pub async fn put(&self, record: &PredictionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        self.store
            .set(
                &Self::record_key(&record.external_id),
                &json,
                self.ttl_for(record),
            )
            .await
    }

    pub async fn get(&self, external_id: &str) -> Result<Option<PredictionRecord>, StoreError> {
        match self.store.get(&Self::record_key(external_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Atomically read-modify-write one record.
    ///
    /// `mutate` may run several times if another writer races this one; it
    /// always sees the latest stored value. Returns None if the record does
    /// not exist (or expired).
    pub async fn update<T, F>(&self, external_id: &str, mut mutate: F) -> Result<Option<T>, StoreError>
    where
        F: FnMut(&mut PredictionRecord) -> Mutation<T>,
    {
        let key = Self::record_key(external_id);
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(current_json) = self.store.get(&key).await? else {
                return Ok(None);
            };
            let mut record: PredictionRecord = serde_json::from_str(&current_json)?;

            let outcome = match mutate(&mut record) {
                Mutation::Keep(outcome) => return Ok(Some(outcome)),
                Mutation::Write(outcome) => outcome,
            };

            let next_json = serde_json::to_string(&record)?;
            if self
                .store
                .compare_and_swap(&key, &current_json, &next_json, self.ttl_for(&record))
                .await?
            {
                return Ok(Some(outcome));
            }
            debug!(external_id = external_id, "prediction update raced, retrying");
        }
        Err(StoreError::Contended(key, MAX_UPDATE_ATTEMPTS))
    }

    pub async fn delete(&self, external_id: &str) -> Result<bool, StoreError> {
        self.store.delete(&Self::record_key(external_id)).await
    }

    // --- Active pointer ---

    pub async fn set_active(&self, channel_id: &str, external_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let ttl = ttl.min(self.ttls.active_pointer);
        self.store
            .set(&Self::active_key(channel_id), external_id, ttl)
            .await?;
        debug!(channel_id = channel_id, external_id = external_id, "active prediction set");
        Ok(())
    }

    /// Point the channel at `external_id` only if no pointer is live. Returns
    /// whether it wrote.
    pub async fn claim_active(&self, channel_id: &str, external_id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let ttl = ttl.min(self.ttls.active_pointer);
        self.store
            .set_if_absent(&Self::active_key(channel_id), external_id, ttl)
            .await
    }

    /// Extend the pointer's TTL if it still names `external_id`.
    pub async fn refresh_active(&self, channel_id: &str, external_id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let ttl = ttl.min(self.ttls.active_pointer);
        self.store
            .compare_and_swap(&Self::active_key(channel_id), external_id, external_id, ttl)
            .await
    }

    pub async fn get_active(&self, channel_id: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&Self::active_key(channel_id)).await
    }

    pub async fn clear_active(&self, channel_id: &str) -> Result<bool, StoreError> {
        let cleared = self.store.delete(&Self::active_key(channel_id)).await?;
        if cleared {
            info!(channel_id = channel_id, "active prediction cleared");
        }
        Ok(cleared)
    }

    /// Clear the pointer only if it still names `external_id`.
    pub async fn clear_active_if(&self, channel_id: &str, external_id: &str) -> Result<bool, StoreError> {
        self.store
            .delete_if_eq(&Self::active_key(channel_id), external_id)
            .await
    }

    // --- Market outcome metadata ---

    pub async fn put_outcome_meta(&self, meta: &MarketOutcomeMeta) -> Result<(), StoreError> {
        let json = serde_json::to_string(meta)?;
        self.store
            .set(&Self::meta_key(meta.market_id), &json, self.ttls.outcome_meta)
            .await
    }

    pub async fn get_outcome_meta(&self, market_id: u64) -> Result<Option<MarketOutcomeMeta>, StoreError> {
        match self.store.get(&Self::meta_key(market_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sample_record(external_id: &str) -> PredictionRecord {
        let now = Utc::now();
        PredictionRecord {
            external_id: external_id.to_string(),
            channel_id: "chan-1".to_string(),
            market_id: None,
            question: "Win the next match?".to_string(),
            outcome_titles: vec!["Yes".to_string(), "No".to_string()],
            outcome_index_map: HashMap::from([("o-yes".to_string(), 0), ("o-no".to_string(), 1)]),
            locks_at: now + chrono::Duration::minutes(5),
            created_at: now,
            updated_at: now,
            lifecycle_state: LifecycleState::Pending,
            pending_lock: false,
            winning_outcome: None,
            failure: None,
        }
    }

    fn store() -> PredictionStore {
        PredictionStore::new(Arc::new(MemoryStore::new()), MappingTtls::default())
    }

    #[test]
    fn test_lifecycle_is_monotonic() {
        use LifecycleState::*;
        assert!(Pending.can_advance_to(Active));
        assert!(Active.can_advance_to(Locked));
        assert!(Active.can_advance_to(Resolved));
        assert!(Pending.can_advance_to(Failed));
        assert!(Locked.can_advance_to(Voided));
        assert!(!Locked.can_advance_to(Active));
        assert!(!Active.can_advance_to(Active));
        assert!(!Resolved.can_advance_to(Locked));
        assert!(!Voided.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Resolved));
    }

    #[test]
    fn test_bind_market_once() {
        let mut record = sample_record("p-0");
        assert!(record.bind_market(7));
        assert!(!record.bind_market(8));
        assert_eq!(record.market_id, Some(7));
        assert_eq!(record.outcome_index("o-no"), Some(1));
        assert_eq!(record.outcome_index("o-missing"), None);
    }

    #[tokio::test]
    async fn test_insert_new_is_idempotent() {
        let store = store();
        let record = sample_record("p-1");
        assert!(store.insert_new(&record).await.unwrap());

        let mut dup = sample_record("p-1");
        dup.question = "something else".to_string();
        assert!(!store.insert_new(&dup).await.unwrap());
        assert_eq!(store.get("p-1").await.unwrap().unwrap().question, record.question);
    }

    #[tokio::test]
    async fn test_update_keep_and_missing() {
        let store = store();
        assert_eq!(
            store.update("nope", |_| Mutation::Write(())).await.unwrap(),
            None
        );

        store.insert_new(&sample_record("p-2")).await.unwrap();
        let state = store
            .update("p-2", |r| Mutation::Keep(r.lifecycle_state))
            .await
            .unwrap();
        assert_eq!(state, Some(LifecycleState::Pending));

        store
            .update("p-2", |r| {
                r.bind_market(11);
                Mutation::Write(r.advance(LifecycleState::Active))
            })
            .await
            .unwrap();
        let record = store.get("p-2").await.unwrap().unwrap();
        assert_eq!(record.market_id, Some(11));
        assert_eq!(record.lifecycle_state, LifecycleState::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let store = store();
        store.insert_new(&sample_record("p-3")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update("p-3", |r| {
                        r.outcome_titles.push(format!("extra-{i}"));
                        Mutation::Write(())
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Some(()));
        }
        let record = store.get("p-3").await.unwrap().unwrap();
        assert_eq!(record.outcome_titles.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_record_expires() {
        let ttls = MappingTtls {
            pending: Duration::from_secs(60),
            ..MappingTtls::default()
        };
        let store = PredictionStore::new(Arc::new(MemoryStore::new()), ttls);
        store.insert_new(&sample_record("p-4")).await.unwrap();
        store.set_active("chan-1", "p-4", ttls.pending).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.get("p-4").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("p-4").await.unwrap().is_none());
        assert!(store.get_active("chan-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_pointer() {
        let store = store();
        store.set_active("chan-1", "p-5", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get_active("chan-1").await.unwrap().as_deref(), Some("p-5"));
        assert!(store.refresh_active("chan-1", "p-5", Duration::from_secs(600)).await.unwrap());
        assert!(!store.refresh_active("chan-1", "p-older", Duration::from_secs(600)).await.unwrap());

        assert!(!store.clear_active_if("chan-1", "p-older").await.unwrap());
        assert!(store.clear_active_if("chan-1", "p-5").await.unwrap());
        assert!(store.get_active("chan-1").await.unwrap().is_none());
        assert!(!store.clear_active("chan-1").await.unwrap());

        assert!(store.claim_active("chan-1", "p-6", Duration::from_secs(60)).await.unwrap());
        assert!(!store.claim_active("chan-1", "p-7", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.get_active("chan-1").await.unwrap().as_deref(), Some("p-6"));
    }

    #[tokio::test]
    async fn test_outcome_meta() {
        let store = store();
        assert!(store.get_outcome_meta(3).await.unwrap().is_none());
        let meta = MarketOutcomeMeta {
            market_id: 3,
            outcomes: vec!["Blue".to_string(), "Red".to_string()],
            question: "Which side wins?".to_string(),
            channel_id: "chan-1".to_string(),
            external_id: "p-6".to_string(),
        };
        store.put_outcome_meta(&meta).await.unwrap();
        assert_eq!(store.get_outcome_meta(3).await.unwrap(), Some(meta));
    }
}
