//! PIN authentication and staff-management authorization with bcrypt.
//!
//! PIN hashes live on `staff_profiles.pin_hash` and are bcrypt with a
//! per-user salt, so verification scans the branch's active profiles and
//! checks each hash rather than looking up a digest. Branch rosters are
//! small; the scan is bounded by bcrypt cost, not row count.

use anyhow::anyhow;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::AppError;

/// Required PIN shape: exactly four ASCII digits.
const PIN_LEN: usize = 4;

/// A staff profile as seen by the attendance flow.
#[derive(Debug)]
pub struct StaffProfile {
    pub id: String,
    pub branch_id: String,
    pub display_name: String,
    pub can_manage_staff: bool,
}

/// Who is asking for a staff-management operation.
pub enum Caller {
    /// Request carried the service admin token.
    Admin,
    /// Branch manager identified by their own id + PIN.
    Manager {
        manager_id: String,
        manager_pin: String,
    },
}

// ---------------------------------------------------------------------------
// PIN verification
// ---------------------------------------------------------------------------

/// Find the active staff member of `branch_id` whose stored PIN matches.
///
/// Returns `None` when no profile matches; the caller reports `WRONG_PIN`.
pub fn verify_branch_pin(
    conn: &Connection,
    branch_id: &str,
    pin: &str,
) -> Result<Option<StaffProfile>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT id, branch_id, display_name, can_manage_staff, pin_hash
         FROM staff_profiles
         WHERE branch_id = ?1 AND is_active = 1 AND pin_hash IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![branch_id], |row| {
        Ok((
            StaffProfile {
                id: row.get(0)?,
                branch_id: row.get(1)?,
                display_name: row.get(2)?,
                can_manage_staff: row.get::<_, i64>(3)? != 0,
            },
            row.get::<_, String>(4)?,
        ))
    })?;

    for row in rows {
        let (profile, hash) = row?;
        if bcrypt::verify(pin, &hash).unwrap_or(false) {
            return Ok(Some(profile));
        }
    }
    Ok(None)
}

/// Validate that `pin` is exactly four ASCII digits.
pub fn validate_pin(pin: &str) -> Result<(), AppError> {
    if pin.len() != PIN_LEN || !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::BadRequest(format!(
            "PIN must be exactly {PIN_LEN} digits"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// set-pin
// ---------------------------------------------------------------------------

/// Set (or replace) the PIN of `user_id`, gated by caller authorization.
///
/// A global admin may set any PIN. A branch manager needs the
/// `can_manage_staff` flag, must belong to the claimed branch, and the
/// target user must belong to it too.
pub fn set_pin(
    db: &DbState,
    caller: Caller,
    user_id: &str,
    pin: &str,
    branch_id: &str,
) -> Result<Value, AppError> {
    validate_pin(pin)?;

    let conn = db
        .conn
        .lock()
        .map_err(|e| AppError::Database(e.to_string()))?;

    let target: Option<(String, i64)> = conn
        .query_row(
            "SELECT branch_id, is_active FROM staff_profiles WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (target_branch, target_active) =
        target.ok_or_else(|| AppError::BadRequest(format!("Unknown staff member {user_id}")))?;

    authorize_staff_management(&conn, &caller, branch_id)?;

    if target_branch != branch_id {
        warn!(user_id, branch_id, "set-pin rejected: branch mismatch");
        return Err(AppError::Forbidden(format!(
            "Staff member {user_id} does not belong to branch {branch_id}"
        )));
    }
    if target_active == 0 {
        return Err(AppError::BadRequest(format!(
            "Staff member {user_id} is inactive"
        )));
    }

    let hash =
        bcrypt::hash(pin, bcrypt::DEFAULT_COST).map_err(|e| anyhow!("hash PIN: {e}"))?;
    conn.execute(
        "UPDATE staff_profiles SET pin_hash = ?1, updated_at = ?2 WHERE id = ?3",
        params![hash, Utc::now().to_rfc3339(), user_id],
    )?;

    info!(user_id, branch_id, "staff PIN updated");
    Ok(json!({ "success": true }))
}

/// Check the caller may manage staff of `branch_id`.
fn authorize_staff_management(
    conn: &Connection,
    caller: &Caller,
    branch_id: &str,
) -> Result<(), AppError> {
    match caller {
        Caller::Admin => Ok(()),
        Caller::Manager {
            manager_id,
            manager_pin,
        } => {
            let manager: Option<(String, i64, Option<String>)> = conn
                .query_row(
                    "SELECT branch_id, can_manage_staff, pin_hash
                     FROM staff_profiles
                     WHERE id = ?1 AND is_active = 1",
                    params![manager_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let (manager_branch, can_manage, pin_hash) = manager
                .ok_or_else(|| AppError::Unauthorized("Unknown manager credential".into()))?;

            let pin_ok = pin_hash
                .map(|h| bcrypt::verify(manager_pin, &h).unwrap_or(false))
                .unwrap_or(false);
            if !pin_ok {
                warn!(manager_id = %manager_id, "set-pin rejected: manager PIN mismatch");
                return Err(AppError::Unauthorized("Manager PIN is incorrect".into()));
            }
            if can_manage == 0 {
                return Err(AppError::Forbidden(
                    "Caller may not manage staff".into(),
                ));
            }
            if manager_branch != branch_id {
                warn!(manager_id = %manager_id, branch_id, "set-pin rejected: cross-branch manager");
                return Err(AppError::Forbidden(
                    "Caller may not manage staff outside their branch".into(),
                ));
            }
            Ok(())
        }
    }
}
