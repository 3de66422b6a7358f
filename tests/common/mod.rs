#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use prediction_bridge::api::{build_router, AppState};
use prediction_bridge::auth;
use prediction_bridge::chain::{ChainError, ChainReceipt, CreateMarketRequest, CreatedMarket, MarketChain};
use prediction_bridge::ledger::{IdempotencyLedger, LedgerTtls};
use prediction_bridge::lifecycle::{DispatchPolicy, Dispatcher};
use prediction_bridge::mapping::{MappingTtls, PredictionStore};
use prediction_bridge::market::PoolSnapshot;
use prediction_bridge::store::{KeyValueStore, MemoryStore};
use prediction_bridge::webhook::{
    HEADER_MESSAGE_ID, HEADER_MESSAGE_SIGNATURE, HEADER_MESSAGE_TIMESTAMP, HEADER_MESSAGE_TYPE,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const SECRET: &str = "s3cr3t-webhook-key";
pub const ADMIN_TOKEN: &str = "admin-token";
pub const CHANNEL: &str = "1337";

static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Relayer stand-in: every call succeeds.
pub struct StubChain {
    pub creates: AtomicUsize,
    pub locks: AtomicUsize,
    pub resolves: AtomicUsize,
    pub voids: AtomicUsize,
    next_market: AtomicU64,
    pub snapshot: PoolSnapshot,
}

impl Default for StubChain {
    fn default() -> Self {
        Self {
            creates: AtomicUsize::new(0),
            locks: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            voids: AtomicUsize::new(0),
            next_market: AtomicU64::new(0),
            snapshot: PoolSnapshot::new(vec![600_000_000, 400_000_000], 100, 100).unwrap(),
        }
    }
}

fn receipt() -> ChainReceipt {
    ChainReceipt {
        tx_hash: "0xfeed".to_string(),
    }
}

#[async_trait]
impl MarketChain for StubChain {
    async fn create_market(&self, _request: &CreateMarketRequest) -> Result<CreatedMarket, ChainError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(CreatedMarket {
            market_id: self.next_market.fetch_add(1, Ordering::SeqCst) + 1,
            tx_hash: "0xcreate".to_string(),
        })
    }

    async fn lock_market(&self, _market_id: u64) -> Result<ChainReceipt, ChainError> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        Ok(receipt())
    }

    async fn resolve_market(&self, _market_id: u64, _winning_outcome: usize) -> Result<ChainReceipt, ChainError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        Ok(receipt())
    }

    async fn void_market(&self, _market_id: u64) -> Result<ChainReceipt, ChainError> {
        self.voids.fetch_add(1, Ordering::SeqCst);
        Ok(receipt())
    }

    async fn pool_snapshot(&self, _market_id: u64) -> Result<PoolSnapshot, ChainError> {
        Ok(self.snapshot.clone())
    }
}

pub struct Harness {
    pub router: Router,
    pub dispatcher: Dispatcher,
    pub chain: Arc<StubChain>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_admin(Some(ADMIN_TOKEN))
    }

    pub fn with_admin(admin_token: Option<&str>) -> Self {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let chain = Arc::new(StubChain::default());
        let policy = DispatchPolicy {
            max_chain_attempts: 3,
            retry_backoff: Duration::from_millis(5),
            max_retry_backoff: Duration::from_millis(20),
            lock_wait_polls: 20,
            lock_wait_interval: Duration::from_millis(10),
        };
        let dispatcher = Dispatcher::new(
            PredictionStore::new(kv.clone(), MappingTtls::default()),
            IdempotencyLedger::new(kv.clone(), LedgerTtls::default()),
            chain.clone(),
            policy,
        );
        let state = AppState {
            dispatcher: dispatcher.clone(),
            chain: chain.clone(),
            kv,
            webhook_secret: SECRET.to_string(),
            max_message_age: Some(Duration::from_secs(600)),
            admin_token: admin_token.map(str::to_string),
        };
        Self {
            router: build_router(state),
            dispatcher,
            chain,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    pub async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = self.send(request).await;
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    /// Deliver a notification and wait for the chain calls it started.
    pub async fn deliver(&self, kind: &str, event: Value) -> StatusCode {
        let (status, _) = self
            .send(signed("notification", &notification(kind, event)))
            .await;
        self.dispatcher.settle().await;
        status
    }
}

pub fn signed(message_type: &str, body: &Value) -> Request<Body> {
    signed_at(message_type, body, &Utc::now().to_rfc3339())
}

pub fn signed_at(message_type: &str, body: &Value, timestamp: &str) -> Request<Body> {
    let raw = serde_json::to_vec(body).unwrap();
    let message_id = format!("msg-{}", MESSAGE_SEQ.fetch_add(1, Ordering::SeqCst));
    let signature = auth::sign(&message_id, timestamp, &raw, SECRET).unwrap();
    webhook_request(message_type, &message_id, timestamp, &signature, raw)
}

pub fn webhook_request(
    message_type: &str,
    message_id: &str,
    timestamp: &str,
    signature: &str,
    raw: Vec<u8>,
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/eventsub")
        .header("content-type", "application/json")
        .header(HEADER_MESSAGE_ID, message_id)
        .header(HEADER_MESSAGE_TIMESTAMP, timestamp)
        .header(HEADER_MESSAGE_SIGNATURE, signature)
        .header(HEADER_MESSAGE_TYPE, message_type)
        .body(Body::from(raw))
        .unwrap()
}

pub fn notification(kind: &str, event: Value) -> Value {
    json!({
        "subscription": {
            "id": "sub-1",
            "type": kind,
            "version": "1",
            "status": "enabled"
        },
        "event": event
    })
}

pub fn begin_event(id: &str) -> Value {
    json!({
        "id": id,
        "broadcaster_user_id": CHANNEL,
        "broadcaster_user_login": "cool_user",
        "title": "Aren't shoes just really hard socks?",
        "outcomes": [
            {"id": "o-yes", "title": "Yeah!", "color": "blue"},
            {"id": "o-no", "title": "No!", "color": "pink"}
        ],
        "started_at": Utc::now().to_rfc3339(),
        "locks_at": (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339()
    })
}
