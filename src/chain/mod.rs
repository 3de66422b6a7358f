//! Chain collaborator boundary.
//!
//! The bridge never signs or decodes transactions itself. It submits market
//! operations to a relayer service that owns the keys and the contract ABI,
//! and waits for the relayer's confirmation:
//!   POST /markets                    → create, returns the new market id
//!   POST /markets/{id}/lock
//!   POST /markets/{id}/resolve       → body { winning_outcome }
//!   POST /markets/{id}/void
//!   GET  /markets/{id}/pools         → PoolSnapshot (read path only)
//!
//! Every request is HMAC-signed (see `auth::build_relayer_headers`).

use crate::auth::{build_relayer_headers, AuthError, RelayerCredentials};
use crate::config::RelayerConfig;
use crate::market::{PoolError, PoolSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("relayer request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("relayer error {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid pool snapshot: {0}")]
    Pool(#[from] PoolError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Parameters for a new market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMarketRequest {
    pub question: String,
    pub outcomes: Vec<String>,
    pub close_time: DateTime<Utc>,
    /// Upstream prediction id, passed through so the relayer can dedupe too.
    pub external_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedMarket {
    pub market_id: u64,
    #[serde(default)]
    pub tx_hash: String,
}

/// Confirmation of a lock / resolve / void.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReceipt {
    #[serde(default)]
    pub tx_hash: String,
}

/// Market operations the lifecycle drives on chain.
#[async_trait]
pub trait MarketChain: Send + Sync {
    async fn create_market(&self, request: &CreateMarketRequest) -> Result<CreatedMarket, ChainError>;

    async fn lock_market(&self, market_id: u64) -> Result<ChainReceipt, ChainError>;

    async fn resolve_market(
        &self,
        market_id: u64,
        winning_outcome: usize,
    ) -> Result<ChainReceipt, ChainError>;

    async fn void_market(&self, market_id: u64) -> Result<ChainReceipt, ChainError>;

    /// Current pools and fee rates, for pricing.
    async fn pool_snapshot(&self, market_id: u64) -> Result<PoolSnapshot, ChainError>;
}

/// Signed HTTP client for the relayer.
pub struct RelayerClient {
    client: reqwest::Client,
    base_url: String,
    creds: RelayerCredentials,
}

impl RelayerClient {
    pub fn new(base_url: String, creds: RelayerCredentials, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
        })
    }

    pub fn from_config(config: &RelayerConfig) -> Result<Self, ChainError> {
        let creds = RelayerCredentials::from_config(&config.api_key, &config.api_secret)
            .ok_or(AuthError::MissingCredentials)?;
        Self::new(
            config.base_url.clone(),
            creds,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// GET with relayer auth.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let headers = build_relayer_headers(&self.creds, "GET", path, "")?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self.client.get(&url).headers(headers).send().await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChainError::Rejected { status, body });
        }
        Ok(resp.json().await?)
    }

    /// POST with relayer auth and JSON body.
    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ChainError> {
        let body_str = serde_json::to_string(body)?;
        let headers = build_relayer_headers(&self.creds, "POST", path, &body_str)?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChainError::Rejected { status, body });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl MarketChain for RelayerClient {
    async fn create_market(&self, request: &CreateMarketRequest) -> Result<CreatedMarket, ChainError> {
        let body = serde_json::to_value(request)?;
        let created: CreatedMarket = self.post("/markets", &body).await?;
        info!(
            market_id = created.market_id,
            tx = %created.tx_hash,
            external_ref = %request.external_ref,
            "market created"
        );
        Ok(created)
    }

    async fn lock_market(&self, market_id: u64) -> Result<ChainReceipt, ChainError> {
        let path = format!("/markets/{}/lock", market_id);
        let receipt: ChainReceipt = self.post(&path, &serde_json::json!({})).await?;
        info!(market_id = market_id, tx = %receipt.tx_hash, "market locked");
        Ok(receipt)
    }

    async fn resolve_market(
        &self,
        market_id: u64,
        winning_outcome: usize,
    ) -> Result<ChainReceipt, ChainError> {
        let path = format!("/markets/{}/resolve", market_id);
        let body = serde_json::json!({ "winning_outcome": winning_outcome });
        let receipt: ChainReceipt = self.post(&path, &body).await?;
        info!(
            market_id = market_id,
            winning_outcome = winning_outcome,
            tx = %receipt.tx_hash,
            "market resolved"
        );
        Ok(receipt)
    }

    async fn void_market(&self, market_id: u64) -> Result<ChainReceipt, ChainError> {
        let path = format!("/markets/{}/void", market_id);
        let receipt: ChainReceipt = self.post(&path, &serde_json::json!({})).await?;
        info!(market_id = market_id, tx = %receipt.tx_hash, "market voided");
        Ok(receipt)
    }

    async fn pool_snapshot(&self, market_id: u64) -> Result<PoolSnapshot, ChainError> {
        let snapshot: PoolSnapshot = self.get(&format!("/markets/{}/pools", market_id)).await?;
        snapshot.validate()?;
        debug!(market_id = market_id, outcomes = snapshot.pools.len(), "pool snapshot");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_market_tolerates_missing_tx() {
        let created: CreatedMarket = serde_json::from_str(r#"{"market_id":17}"#).unwrap();
        assert_eq!(created.market_id, 17);
        assert!(created.tx_hash.is_empty());
    }

    #[test]
    fn test_client_trims_base_url() {
        let creds = RelayerCredentials::from_config("k", "s").unwrap();
        let client =
            RelayerClient::new("http://relayer:9000/".to_string(), creds, Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "http://relayer:9000");
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = RelayerConfig {
            base_url: "http://relayer:9000".to_string(),
            ..RelayerConfig::default()
        };
        assert!(matches!(
            RelayerClient::from_config(&config),
            Err(ChainError::Auth(AuthError::MissingCredentials))
        ));
    }
}
