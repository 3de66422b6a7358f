use crate::ledger::LedgerTtls;
use crate::lifecycle::DispatchPolicy;
use crate::mapping::MappingTtls;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub valkey: ValkeyConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the webhook intake and read API listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValkeyConfig {
    /// Valkey/Redis URL - loaded from env VALKEY_URL. Empty runs on the
    /// in-process store (single replica only).
    #[serde(default)]
    pub url: String,
    /// Key namespace, so several deployments can share one server.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret - loaded from env WEBHOOK_SECRET
    #[serde(default)]
    pub secret: String,
    /// Reject notifications older than this. 0 disables the check.
    #[serde(default = "default_max_message_age")]
    pub max_message_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    /// Chain relayer base URL - loaded from env RELAYER_URL
    #[serde(default)]
    pub base_url: String,
    /// Loaded from env RELAYER_API_KEY
    #[serde(default)]
    pub api_key: String,
    /// Loaded from env RELAYER_API_SECRET
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

/// Bounded retention for everything the bridge keeps.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_operation_pending")]
    pub operation_pending_secs: u64,
    #[serde(default = "default_operation_completed")]
    pub operation_completed_secs: u64,
    #[serde(default = "default_operation_failed")]
    pub operation_failed_secs: u64,
    /// How long an unconfirmed prediction waits for its market.
    #[serde(default = "default_prediction_pending")]
    pub prediction_pending_secs: u64,
    #[serde(default = "default_prediction_record")]
    pub prediction_record_secs: u64,
    #[serde(default = "default_active_pointer")]
    pub active_pointer_secs: u64,
    #[serde(default = "default_outcome_meta")]
    pub outcome_meta_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_chain_attempts")]
    pub max_chain_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
    #[serde(default = "default_lock_wait_polls")]
    pub lock_wait_polls: u32,
    #[serde(default = "default_lock_wait_interval_ms")]
    pub lock_wait_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    /// Bearer token for admin routes - loaded from env ADMIN_TOKEN.
    /// Empty disables them.
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_key_prefix() -> String {
    "bridge".to_string()
}
fn default_max_message_age() -> u64 {
    600
}
fn default_request_timeout() -> u64 {
    15
}
fn default_operation_pending() -> u64 {
    15 * 60
}
fn default_operation_completed() -> u64 {
    7 * 86_400
}
fn default_operation_failed() -> u64 {
    86_400
}
fn default_prediction_pending() -> u64 {
    30 * 60
}
fn default_prediction_record() -> u64 {
    2 * 86_400
}
fn default_active_pointer() -> u64 {
    86_400
}
fn default_outcome_meta() -> u64 {
    30 * 86_400
}
fn default_max_chain_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    2_000
}
fn default_max_retry_backoff_ms() -> u64 {
    60_000
}
fn default_lock_wait_polls() -> u32 {
    30
}
fn default_lock_wait_interval_ms() -> u64 {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            max_message_age_secs: default_max_message_age(),
        }
    }
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            operation_pending_secs: default_operation_pending(),
            operation_completed_secs: default_operation_completed(),
            operation_failed_secs: default_operation_failed(),
            prediction_pending_secs: default_prediction_pending(),
            prediction_record_secs: default_prediction_record(),
            active_pointer_secs: default_active_pointer(),
            outcome_meta_secs: default_outcome_meta(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_chain_attempts: default_max_chain_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            lock_wait_polls: default_lock_wait_polls(),
            lock_wait_interval_ms: default_lock_wait_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl RetentionConfig {
    pub fn ledger_ttls(&self) -> LedgerTtls {
        LedgerTtls {
            pending: Duration::from_secs(self.operation_pending_secs),
            completed: Duration::from_secs(self.operation_completed_secs),
            failed: Duration::from_secs(self.operation_failed_secs),
        }
    }

    pub fn mapping_ttls(&self) -> MappingTtls {
        MappingTtls {
            pending: Duration::from_secs(self.prediction_pending_secs),
            record: Duration::from_secs(self.prediction_record_secs),
            active_pointer: Duration::from_secs(self.active_pointer_secs),
            outcome_meta: Duration::from_secs(self.outcome_meta_secs),
        }
    }
}

impl DispatchConfig {
    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_chain_attempts: self.max_chain_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(self.max_retry_backoff_ms),
            lock_wait_polls: self.lock_wait_polls,
            lock_wait_interval: Duration::from_millis(self.lock_wait_interval_ms),
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Load a default config with env-only secrets (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    // Secrets never live in the config file
    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("VALKEY_URL") {
            self.valkey.url = url;
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            self.webhook.secret = secret;
        }
        if let Ok(url) = std::env::var("RELAYER_URL") {
            self.relayer.base_url = url;
        }
        if let Ok(key) = std::env::var("RELAYER_API_KEY") {
            self.relayer.api_key = key;
        }
        if let Ok(secret) = std::env::var("RELAYER_API_SECRET") {
            self.relayer.api_secret = secret;
        }
        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            self.admin.token = token;
        }
    }

    /// Refuse to start without what the bridge needs to stay safe.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook.secret.is_empty() {
            return Err(ConfigError::MissingEnv("WEBHOOK_SECRET".to_string()));
        }
        if self.relayer.base_url.is_empty() {
            return Err(ConfigError::MissingEnv("RELAYER_URL".to_string()));
        }
        if self.dispatch.max_chain_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_chain_attempts must be at least 1".to_string(),
            ));
        }
        if self.retention.operation_pending_secs == 0 || self.retention.prediction_pending_secs == 0 {
            return Err(ConfigError::Invalid("pending retention must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn has_relayer_credentials(&self) -> bool {
        !self.relayer.api_key.is_empty() && !self.relayer.api_secret.is_empty()
    }

    pub fn admin_enabled(&self) -> bool {
        !self.admin.token.is_empty()
    }
}
