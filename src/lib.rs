//! Branch attendance service.
//!
//! HTTP backend for the rotating-QR clock-in flow used across franchise
//! branches: a branch display polls `generate` for a fresh signed code,
//! staff scan it and confirm with their PIN, and `set-pin` lets admins and
//! branch managers provision those PINs. See `routes` for the endpoint
//! contract and `token` for the signing scheme.

pub mod attendance;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod token;

/// Read the first non-empty string field matching one of `keys`.
///
/// Payloads arrive from two generations of clients that disagree on
/// camelCase vs snake_case, so lookups take the accepted aliases.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
