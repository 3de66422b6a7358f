use prediction_bridge::api::{self, AppState};
use prediction_bridge::chain::{MarketChain, RelayerClient};
use prediction_bridge::config::Config;
use prediction_bridge::ledger::IdempotencyLedger;
use prediction_bridge::lifecycle::Dispatcher;
use prediction_bridge::mapping::PredictionStore;
use prediction_bridge::store::{KeyValueStore, MemoryStore, ValkeyStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CONFIG_FILE: &str = "bridge.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config_found = Path::new(CONFIG_FILE).exists();
    let config = if config_found {
        Config::load(Path::new(CONFIG_FILE))?
    } else {
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("prediction-bridge v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_found {
        info!("no {} found, using env-only config", CONFIG_FILE);
    }
    config.validate()?;

    // --- Keyed store ---
    // A configured Valkey that cannot be reached is fatal: without the shared
    // ledger, replicas could double-submit chain operations.
    let kv: Arc<dyn KeyValueStore> = if config.valkey.url.is_empty() {
        warn!("VALKEY_URL not set - using in-process store, run a single replica only");
        Arc::new(MemoryStore::new())
    } else {
        let store = ValkeyStore::connect(&config.valkey.url, &config.valkey.key_prefix)
            .await
            .map_err(|e| {
                error!(error = %e, url = %config.valkey.url, "failed to connect to Valkey");
                e
            })?;
        store.ping().await?;
        info!(url = %config.valkey.url, prefix = %config.valkey.key_prefix, "Valkey store connected");
        Arc::new(store)
    };

    // --- Chain relayer ---
    if !config.has_relayer_credentials() {
        error!("relayer credentials missing (set RELAYER_API_KEY, RELAYER_API_SECRET)");
    }
    let chain: Arc<dyn MarketChain> = Arc::new(RelayerClient::from_config(&config.relayer)?);
    info!(relayer = %config.relayer.base_url, "chain relayer configured");

    // --- Dispatcher ---
    let predictions = PredictionStore::new(kv.clone(), config.retention.mapping_ttls());
    let ledger = IdempotencyLedger::new(kv.clone(), config.retention.ledger_ttls());
    let dispatcher = Dispatcher::new(predictions, ledger, chain.clone(), config.dispatch.policy());

    if !config.admin_enabled() {
        info!("ADMIN_TOKEN not set, admin routes disabled");
    }
    let max_message_age = match config.webhook.max_message_age_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let state = AppState {
        dispatcher: dispatcher.clone(),
        chain,
        kv,
        webhook_secret: config.webhook.secret.clone(),
        max_message_age,
        admin_token: config.admin_enabled().then(|| config.admin.token.clone()),
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown requested");
    };
    api::serve(state, &config.server.bind_addr, shutdown).await?;

    dispatcher.shutdown().await;
    info!("prediction-bridge stopped");
    Ok(())
}
