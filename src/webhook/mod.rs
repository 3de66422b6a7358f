//! EventSub webhook intake.
//!
//!   POST /webhooks/eventsub
//!
//! The raw body is HMAC-verified before it is parsed. Nothing is read from
//! or written to the store for a message that fails verification.
//!
//! Message types:
//!   webhook_callback_verification → echo `challenge` as text/plain
//!   notification                  → channel.prediction.{begin,progress,lock,end}
//!   revocation                    → logged only

use crate::api::AppState;
use crate::auth;
use crate::error::BridgeError;
use crate::lifecycle::{
    BeginEvent, EndEvent, EndStatus, LockEvent, PredictionEvent, ProgressEvent, UpstreamOutcome,
};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const HEADER_MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "twitch-eventsub-message-signature";
pub const HEADER_MESSAGE_TYPE: &str = "twitch-eventsub-message-type";

pub const SUBSCRIPTION_BEGIN: &str = "channel.prediction.begin";
pub const SUBSCRIPTION_PROGRESS: &str = "channel.prediction.progress";
pub const SUBSCRIPTION_LOCK: &str = "channel.prediction.lock";
pub const SUBSCRIPTION_END: &str = "channel.prediction.end";

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("unsupported subscription type: {0}")]
    UnsupportedType(String),
    #[error("notification has no event payload")]
    MissingEvent,
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown end status: {0}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Verification,
    Notification,
    Revocation,
}

impl MessageType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "webhook_callback_verification" => Some(MessageType::Verification),
            "notification" => Some(MessageType::Notification),
            "revocation" => Some(MessageType::Revocation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: String,
}

/// Top-level body shared by all three message types.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub subscription: Subscription,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub event: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireOutcome {
    id: String,
    title: String,
}

impl From<WireOutcome> for UpstreamOutcome {
    fn from(o: WireOutcome) -> Self {
        UpstreamOutcome {
            id: o.id,
            title: o.title,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireBegin {
    id: String,
    broadcaster_user_id: String,
    title: String,
    outcomes: Vec<WireOutcome>,
    locks_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WireProgress {
    id: String,
    #[serde(default)]
    outcomes: Vec<WireOutcome>,
}

#[derive(Debug, Deserialize)]
struct WireLock {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireEnd {
    id: String,
    status: String,
    #[serde(default)]
    winning_outcome_id: Option<String>,
}

/// Turn one notification payload into a lifecycle event.
pub fn parse_event(subscription_type: &str, event: serde_json::Value) -> Result<PredictionEvent, IntakeError> {
    match subscription_type {
        SUBSCRIPTION_BEGIN => {
            let e: WireBegin = serde_json::from_value(event)?;
            Ok(PredictionEvent::Begin(BeginEvent {
                external_id: e.id,
                channel_id: e.broadcaster_user_id,
                title: e.title,
                outcomes: e.outcomes.into_iter().map(Into::into).collect(),
                locks_at: e.locks_at,
            }))
        }
        SUBSCRIPTION_PROGRESS => {
            let e: WireProgress = serde_json::from_value(event)?;
            Ok(PredictionEvent::Progress(ProgressEvent {
                external_id: e.id,
                outcomes: e.outcomes.into_iter().map(Into::into).collect(),
            }))
        }
        SUBSCRIPTION_LOCK => {
            let e: WireLock = serde_json::from_value(event)?;
            Ok(PredictionEvent::Lock(LockEvent { external_id: e.id }))
        }
        SUBSCRIPTION_END => {
            let e: WireEnd = serde_json::from_value(event)?;
            let status = match e.status.as_str() {
                "resolved" => EndStatus::Resolved,
                "canceled" => EndStatus::Canceled,
                other => return Err(IntakeError::UnknownStatus(other.to_string())),
            };
            Ok(PredictionEvent::End(EndEvent {
                external_id: e.id,
                status,
                winning_outcome_id: e.winning_outcome_id,
            }))
        }
        other => Err(IntakeError::UnsupportedType(other.to_string())),
    }
}

/// Whether a message timestamp is inside the replay window. `None` disables
/// the check; an unparseable timestamp is never fresh.
pub fn is_fresh(timestamp: &str, max_age: Option<Duration>, now: DateTime<Utc>) -> bool {
    let Some(max_age) = max_age else {
        return true;
    };
    let Ok(sent_at) = DateTime::parse_from_rfc3339(timestamp) else {
        return false;
    };
    match (now - sent_at.with_timezone(&Utc)).to_std() {
        Ok(age) => age <= max_age,
        // Sent "in the future": clock skew, not a replay
        Err(_) => true,
    }
}

/// HTTP status for a dispatch error. Anything 2xx stops upstream redelivery.
pub fn status_for(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::SignatureInvalid => StatusCode::FORBIDDEN,
        BridgeError::UnknownPrediction(_) => StatusCode::NO_CONTENT,
        BridgeError::OperationConflict(_) => StatusCode::CONFLICT,
        BridgeError::ChainCallFailed { .. } => StatusCode::BAD_GATEWAY,
        BridgeError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

pub async fn eventsub(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let message_id = header_str(&headers, HEADER_MESSAGE_ID);
    let timestamp = header_str(&headers, HEADER_MESSAGE_TIMESTAMP);
    let signature = header_str(&headers, HEADER_MESSAGE_SIGNATURE);

    if !auth::verify(message_id, timestamp, &body, signature, &state.webhook_secret) {
        warn!(message_id = message_id, "webhook signature rejected");
        return status_for(&BridgeError::SignatureInvalid).into_response();
    }
    if !is_fresh(timestamp, state.max_message_age, Utc::now()) {
        warn!(message_id = message_id, timestamp = timestamp, "stale webhook message rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(message_id = message_id, error = %e, "unparseable webhook body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match MessageType::parse(header_str(&headers, HEADER_MESSAGE_TYPE)) {
        Some(MessageType::Verification) => match envelope.challenge {
            Some(challenge) => {
                info!(
                    subscription_id = %envelope.subscription.id,
                    kind = %envelope.subscription.kind,
                    "subscription verified"
                );
                (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], challenge).into_response()
            }
            None => StatusCode::BAD_REQUEST.into_response(),
        },
        Some(MessageType::Revocation) => {
            warn!(
                subscription_id = %envelope.subscription.id,
                kind = %envelope.subscription.kind,
                status = %envelope.subscription.status,
                "subscription revoked"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Some(MessageType::Notification) => notification(&state, message_id, envelope).await,
        None => {
            warn!(message_id = message_id, "unknown webhook message type");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn notification(state: &AppState, message_id: &str, envelope: Envelope) -> Response {
    let kind = envelope.subscription.kind;
    let event = envelope
        .event
        .ok_or(IntakeError::MissingEvent)
        .and_then(|event| parse_event(&kind, event));
    let event = match event {
        Ok(event) => event,
        Err(IntakeError::UnsupportedType(kind)) => {
            debug!(message_id = message_id, kind = %kind, "notification for unhandled subscription");
            return StatusCode::NO_CONTENT.into_response();
        }
        Err(e) => {
            warn!(message_id = message_id, kind = %kind, error = %e, "bad notification payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let external_id = event.external_id().to_string();
    match state.dispatcher.handle(event).await {
        Ok(outcome) => {
            info!(
                message_id = message_id,
                external_id = %external_id,
                kind = %kind,
                outcome = ?outcome,
                "notification accepted"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            let status = status_for(&e);
            warn!(
                message_id = message_id,
                external_id = %external_id,
                kind = %kind,
                error = %e,
                status = status.as_u16(),
                "notification not applied"
            );
            status.into_response()
        }
    }
}
