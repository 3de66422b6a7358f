//! HTTP surface: webhook intake, read API and admin override.
//!
//!   POST   /webhooks/eventsub                  → see `webhook`
//!   GET    /healthz                            → store ping
//!   GET    /api/channels/:channel_id/active    → external_id of the live prediction
//!                                                plus its record, both nullable
//!   GET    /api/predictions/:external_id       → PredictionRecord
//!   GET    /api/markets/:market_id/outcomes    → MarketOutcomeMeta
//!   GET    /api/markets/:market_id/quote       → prices, plus a payout when
//!                                                `?outcome=&amount=` are given
//!   DELETE /api/admin/channels/:channel_id/active  (Authorization: Bearer <admin token>)
//!
//! Reads are snapshots and may lag in-flight chain confirmations. A store
//! failure on a read degrades to not-found.

use crate::auth;
use crate::chain::MarketChain;
use crate::lifecycle::Dispatcher;
use crate::market::{quote, MarketQuote};
use crate::store::KeyValueStore;
use crate::webhook;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub chain: Arc<dyn MarketChain>,
    pub kv: Arc<dyn KeyValueStore>,
    pub webhook_secret: String,
    /// Replay window for webhook messages; None accepts any age.
    pub max_message_age: Option<Duration>,
    /// None disables the admin routes.
    pub admin_token: Option<String>,
}

/// Build the Axum router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/eventsub", post(webhook::eventsub))
        .route("/healthz", get(healthz))
        .route("/api/channels/:channel_id/active", get(active_prediction))
        .route("/api/predictions/:external_id", get(prediction))
        .route("/api/markets/:market_id/outcomes", get(market_outcomes))
        .route("/api/markets/:market_id/quote", get(market_quote))
        .route("/api/admin/channels/:channel_id/active", delete(admin_clear_active))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, bind_addr: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "bridge listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

// --- Handlers ---

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.kv.ping().await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => {
            warn!(error = %e, "health check: store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "store_unavailable" })),
            )
                .into_response()
        }
    }
}

async fn active_prediction(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    let store = state.dispatcher.store();
    let external_id = store.get_active(&channel_id).await.unwrap_or_else(|e| {
        warn!(channel_id = %channel_id, error = %e, "active pointer read failed");
        None
    });

    let prediction = match external_id.as_deref() {
        Some(id) => store.get(id).await.unwrap_or_else(|e| {
            warn!(external_id = %id, error = %e, "prediction read failed");
            None
        }),
        None => None,
    };

    // `external_id` is the pointer itself; `prediction` is the record it
    // names, null if that record is gone.
    Json(serde_json::json!({
        "channel_id": channel_id,
        "external_id": external_id,
        "prediction": prediction,
    }))
}

async fn prediction(State(state): State<AppState>, Path(external_id): Path<String>) -> impl IntoResponse {
    match state.dispatcher.store().get(&external_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(external_id = %external_id, error = %e, "prediction read failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn market_outcomes(State(state): State<AppState>, Path(market_id): Path<u64>) -> impl IntoResponse {
    match state.dispatcher.store().get_outcome_meta(market_id).await {
        Ok(Some(meta)) => Json(meta).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(market_id = market_id, error = %e, "outcome metadata read failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QuoteParams {
    pub outcome: Option<usize>,
    /// Stake in base units.
    pub amount: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PayoutQuote {
    pub outcome: usize,
    pub amount: i64,
    pub payout: u128,
}

#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    pub market_id: u64,
    pub quote: MarketQuote,
    pub payout: Option<PayoutQuote>,
}

async fn market_quote(
    State(state): State<AppState>,
    Path(market_id): Path<u64>,
    Query(params): Query<QuoteParams>,
) -> impl IntoResponse {
    let snapshot = match state.chain.pool_snapshot(market_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(market_id = market_id, error = %e, "pool snapshot unavailable");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let titles = match state.dispatcher.store().get_outcome_meta(market_id).await {
        Ok(meta) => meta.map(|m| m.outcomes).unwrap_or_default(),
        Err(e) => {
            warn!(market_id = market_id, error = %e, "outcome titles unavailable");
            Vec::new()
        }
    };

    let payout = match (params.outcome, params.amount) {
        (Some(outcome), Some(amount)) => Some(PayoutQuote {
            outcome,
            amount,
            payout: snapshot.payout(i128::from(amount), outcome),
        }),
        _ => None,
    };

    Json(QuoteResponse {
        market_id,
        quote: quote(&snapshot, &titles),
        payout,
    })
    .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Clear the channel pointer, then delete the record it named.
async fn admin_clear_active(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let authorized = bearer_token(&headers).is_some_and(|token| auth::token_matches(token, expected));
    if !authorized {
        warn!(channel_id = %channel_id, "admin request rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let store = state.dispatcher.store();
    let external_id = match store.get_active(&channel_id).await {
        Ok(id) => id,
        Err(e) => {
            error!(channel_id = %channel_id, error = %e, "admin clear: pointer read failed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let pointer_cleared = match store.clear_active(&channel_id).await {
        Ok(cleared) => cleared,
        Err(e) => {
            error!(channel_id = %channel_id, error = %e, "admin clear: pointer delete failed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let record_deleted = match &external_id {
        Some(id) => match store.delete(id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!(external_id = %id, error = %e, "admin clear: record delete failed");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        },
        None => false,
    };

    info!(
        channel_id = %channel_id,
        external_id = ?external_id,
        pointer_cleared = pointer_cleared,
        record_deleted = record_deleted,
        "admin cleared active prediction"
    );
    Json(serde_json::json!({
        "channel_id": channel_id,
        "external_id": external_id,
        "pointer_cleared": pointer_cleared,
        "record_deleted": record_deleted,
    }))
    .into_response()
}
