//! HTTP surface: a single edge-style action endpoint plus a health probe.
//!
//! `POST /attendance` accepts `{action, ...params}` with actions
//! `generate | validate | clock-in | set-pin`, mirroring the serverless
//! function it replaces. CORS is open: the branch QR display and the staff
//! scanner run on arbitrary origins.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::attendance;
use crate::auth::{self, Caller};
use crate::config::Config;
use crate::db::DbState;
use crate::error::AppError;
use crate::value_str;

/// Header carrying the service admin token for `set-pin`.
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Shared application state.
pub struct AppState {
    pub db: DbState,
    pub config: Config,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/attendance", post(attendance_action))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn attendance_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let action = value_str(&payload, &["action"])
        .ok_or_else(|| AppError::BadRequest("Missing action".into()))?;
    info!(action = %action, "attendance request");
    dispatch(&state, &headers, &action, &payload).map(Json)
}

fn dispatch(
    state: &AppState,
    headers: &HeaderMap,
    action: &str,
    payload: &Value,
) -> Result<Value, AppError> {
    let secret = state.config.signing_secret.as_str();
    match action {
        "generate" => {
            let branch_id = value_str(payload, &["branchId", "branch_id"])
                .ok_or_else(|| AppError::BadRequest("branchId is required".into()))?;
            attendance::generate(&state.db, secret, &branch_id)
        }
        "validate" => {
            let token = value_str(payload, &["token"])
                .ok_or_else(|| AppError::BadRequest("token is required".into()))?;
            Ok(attendance::validate(secret, &token))
        }
        "clock-in" => {
            let token = value_str(payload, &["token"])
                .ok_or_else(|| AppError::BadRequest("token is required".into()))?;
            let pin = value_str(payload, &["pin"])
                .ok_or_else(|| AppError::BadRequest("pin is required".into()))?;
            let photo_url = value_str(payload, &["photoUrl", "photo_url"]);
            let ip = requester_ip(headers);
            attendance::clock_in(
                &state.db,
                secret,
                &token,
                &pin,
                photo_url.as_deref(),
                ip.as_deref(),
            )
        }
        "set-pin" => {
            let user_id = value_str(payload, &["userId", "user_id"])
                .ok_or_else(|| AppError::BadRequest("userId is required".into()))?;
            let pin = value_str(payload, &["pin"])
                .ok_or_else(|| AppError::BadRequest("pin is required".into()))?;
            let branch_id = value_str(payload, &["branchId", "branch_id"])
                .ok_or_else(|| AppError::BadRequest("branchId is required".into()))?;
            let caller = resolve_caller(state, headers, payload)?;
            auth::set_pin(&state.db, caller, &user_id, &pin, &branch_id)
        }
        other => Err(AppError::BadRequest(format!("Unknown action: {other}"))),
    }
}

/// Requester IP as seen through the proxy chain.
fn requester_ip(headers: &HeaderMap) -> Option<String> {
    for key in ["x-forwarded-for", "x-real-ip"] {
        if let Some(raw) = headers.get(key).and_then(|v| v.to_str().ok()) {
            let first = raw.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    None
}

/// Resolve who is calling `set-pin`: a presented admin token wins (and must
/// match), otherwise the payload has to carry a manager credential.
fn resolve_caller(
    state: &AppState,
    headers: &HeaderMap,
    payload: &Value,
) -> Result<Caller, AppError> {
    if let Some(provided) = headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        return match state.config.admin_token.as_deref() {
            Some(expected) if provided == expected => Ok(Caller::Admin),
            _ => Err(AppError::Unauthorized("Invalid admin token".into())),
        };
    }

    let manager_id = value_str(payload, &["managerId", "manager_id"]);
    let manager_pin = value_str(payload, &["managerPin", "manager_pin"]);
    match (manager_id, manager_pin) {
        (Some(manager_id), Some(manager_pin)) => Ok(Caller::Manager {
            manager_id,
            manager_pin,
        }),
        _ => Err(AppError::Unauthorized(
            "set-pin requires the admin token or a manager credential".into(),
        )),
    }
}
