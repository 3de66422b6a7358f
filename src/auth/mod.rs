//! HMAC-SHA256 message authentication.
//!
//! Two directions share the same primitive:
//! - Inbound: EventSub webhook notifications are signed with
//!   HMAC-SHA256(secret, message_id + timestamp + raw_body), hex encoded and
//!   prefixed with `sha256=`. [`verify`] is the only gate before any state
//!   mutation.
//! - Outbound: requests to the chain relayer carry a base64 HMAC-SHA256 over
//!   timestamp + method + path + body (see [`build_relayer_headers`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Prefix EventSub puts in front of the hex digest.
pub const SIGNATURE_PREFIX: &str = "sha256=";

const HEADER_API_KEY: &str = "X-RELAYER-KEY";
const HEADER_SIGNATURE: &str = "X-RELAYER-SIGNATURE";
const HEADER_TIMESTAMP: &str = "X-RELAYER-TIMESTAMP";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing relayer credentials")]
    MissingCredentials,
    #[error("HMAC key error: {0}")]
    HmacKey(String),
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

/// Compute the `sha256=<hex>` signature EventSub would send for a message.
pub fn sign(
    message_id: &str,
    timestamp: &str,
    raw_body: &[u8],
    secret: &str,
) -> Result<String, AuthError> {
    let mac = mac_for(secret, message_id, timestamp, raw_body)?;
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verify an EventSub signature.
///
/// Never panics and never errors: empty inputs, a missing prefix, a digest of
/// the wrong length, bad hex, or a mismatch all return `false`. The final
/// comparison goes through `Mac::verify_slice`, which is constant time.
pub fn verify(
    message_id: &str,
    timestamp: &str,
    raw_body: &[u8],
    signature: &str,
    secret: &str,
) -> bool {
    if message_id.is_empty()
        || timestamp.is_empty()
        || raw_body.is_empty()
        || signature.is_empty()
        || secret.is_empty()
    {
        return false;
    }

    let Some(hex_digest) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        debug!("signature missing sha256= prefix");
        return false;
    };

    // 32-byte digest, two hex chars per byte
    if hex_digest.len() != 64 {
        debug!(len = hex_digest.len(), "signature length mismatch");
        return false;
    }

    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    match mac_for(secret, message_id, timestamp, raw_body) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

fn mac_for(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    raw_body: &[u8],
) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AuthError::HmacKey(e.to_string()))?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(raw_body);
    Ok(mac)
}

/// Compare a presented bearer token against the configured one in constant
/// time. Both sides are reduced to fixed-size MACs first, so neither the
/// length nor the position of the first mismatch leaks.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    if presented.is_empty() || expected.is_empty() {
        return false;
    }
    let tag = |token: &str| -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(expected.as_bytes())
            .map_err(|e| AuthError::HmacKey(e.to_string()))?;
        mac.update(token.as_bytes());
        Ok(mac)
    };
    match (tag(presented), tag(expected)) {
        (Ok(presented), Ok(expected)) => presented
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

/// Credentials for signing requests to the chain relayer.
#[derive(Debug, Clone)]
pub struct RelayerCredentials {
    pub api_key: String,
    pub secret: String,
}

impl RelayerCredentials {
    pub fn from_config(api_key: &str, secret: &str) -> Option<Self> {
        if api_key.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self {
            api_key: api_key.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// Build signed headers for a relayer request.
///
/// The signature is HMAC-SHA256(secret, timestamp + METHOD + path + body)
/// encoded as base64.
pub fn build_relayer_headers(
    creds: &RelayerCredentials,
    method: &str,
    path: &str,
    body: &str,
) -> Result<HeaderMap, AuthError> {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let message = format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body);

    let mut mac = HmacSha256::new_from_slice(creds.secret.as_bytes())
        .map_err(|e| AuthError::HmacKey(e.to_string()))?;
    mac.update(message.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    debug!(
        method = method,
        path = path,
        timestamp = %timestamp,
        "built relayer auth headers"
    );

    let mut headers = HeaderMap::new();
    headers.insert(HEADER_API_KEY, HeaderValue::from_str(&creds.api_key)?);
    headers.insert(HEADER_SIGNATURE, HeaderValue::from_str(&signature)?);
    headers.insert(HEADER_TIMESTAMP, HeaderValue::from_str(&timestamp)?);
    Ok(headers)
}
