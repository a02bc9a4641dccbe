//! Rotating attendance token protocol.
//!
//! A token is `base64(payload).signature`: the payload is a JSON object
//! `{branchId, timestamp, salt}` and the signature is the first 16 hex
//! characters of an HMAC-SHA256 over the serialized payload bytes, keyed by
//! the server-held signing secret. The signature binds a token to one branch
//! and a 30-second window, so a photographed or shared QR code cannot be
//! replayed after expiry or against a different branch. Single-use
//! enforcement is layered on top via the persisted token record (see
//! `attendance::clock_in`).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// How long a minted token stays valid.
pub const TOKEN_TTL_MS: i64 = 30_000;

/// Tolerated clock skew for tokens claiming a future timestamp.
pub const SKEW_TOLERANCE_MS: i64 = 5_000;

/// Hex characters of the HMAC kept as the signature segment.
const SIGNATURE_HEX_LEN: usize = 16;

/// Payload embedded in the base64 segment of a token.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub branch_id: String,
    /// Unix millis at mint time.
    pub timestamp: i64,
    /// 16 random bytes, hex-encoded.
    pub salt: String,
}

/// Claims extracted from a successfully validated token.
#[derive(Debug, PartialEq, Eq)]
pub struct TokenClaims {
    pub branch_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token")]
    InvalidFormat,
    #[error("Token signature does not match")]
    InvalidSignature,
    #[error("Code has expired, scan a fresh one")]
    Expired,
    #[error("Code timestamp is in the future, check the device clock")]
    ClockSkew,
}

impl TokenError {
    /// Stable machine-readable code carried in JSON responses.
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::InvalidFormat => "INVALID_FORMAT",
            TokenError::InvalidSignature => "INVALID_SIGNATURE",
            TokenError::Expired => "EXPIRED",
            TokenError::ClockSkew => "CLOCK_SKEW",
        }
    }
}

/// First `SIGNATURE_HEX_LEN` hex chars of `HMAC-SHA256(secret, payload)`.
fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..SIGNATURE_HEX_LEN].to_string()
}

/// Mint a signed token for `branch_id` stamped at `now_ms`.
pub fn mint(branch_id: &str, now_ms: i64, secret: &str) -> (String, TokenPayload) {
    let payload = TokenPayload {
        branch_id: branch_id.to_string(),
        timestamp: now_ms,
        salt: Uuid::new_v4().simple().to_string(),
    };
    let json = serde_json::to_vec(&payload).expect("token payload serializes");
    let token = format!("{}.{}", BASE64_STANDARD.encode(&json), sign(&json, secret));
    (token, payload)
}

/// Validate `token` against `secret` as of `now_ms`.
///
/// The signature is recomputed over the decoded payload bytes exactly as
/// received; re-serializing the parsed struct could reorder fields and
/// reject tokens this server minted.
pub fn validate(token: &str, now_ms: i64, secret: &str) -> Result<TokenClaims, TokenError> {
    let (encoded, signature) = token.split_once('.').ok_or(TokenError::InvalidFormat)?;
    if encoded.is_empty() || signature.is_empty() {
        return Err(TokenError::InvalidFormat);
    }

    let payload_bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|_| TokenError::InvalidFormat)?;

    if sign(&payload_bytes, secret) != signature {
        return Err(TokenError::InvalidSignature);
    }

    let payload: TokenPayload =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::InvalidFormat)?;

    let age = now_ms - payload.timestamp;
    if age > TOKEN_TTL_MS {
        return Err(TokenError::Expired);
    }
    if age < -SKEW_TOLERANCE_MS {
        return Err(TokenError::ClockSkew);
    }

    Ok(TokenClaims {
        branch_id: payload.branch_id,
        timestamp: payload.timestamp,
    })
}

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
