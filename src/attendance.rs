//! Clock-in/out flow backed by single-use attendance tokens.
//!
//! `generate` mints a signed token and persists its record; `clock-in`
//! validates the token cryptographically, consumes the record, verifies the
//! staff PIN, and toggles between opening and closing today's attendance
//! row. All clock-in writes run inside one IMMEDIATE transaction on the
//! shared connection, so two simultaneous scans of the same code are
//! serialized and the loser sees `used_at` already set.

use chrono::{Duration, Local, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::db::DbState;
use crate::error::AppError;
use crate::token::{self, TokenError};

/// Unused token records older than this past their expiry are purged.
const TOKEN_RETENTION_HOURS: i64 = 24;

/// Domain-level failure body: HTTP 200, `success:false`.
fn domain_error(code: &str, message: &str) -> Value {
    json!({ "success": false, "error": code, "message": message })
}

fn token_error(e: &TokenError) -> Value {
    domain_error(e.code(), &e.to_string())
}

// ---------------------------------------------------------------------------
// generate
// ---------------------------------------------------------------------------

/// Mint a token for `branch_id` and persist its record.
///
/// Returns `{token, expiresAt, serverTime}`; the display uses `serverTime`
/// to schedule its refresh without trusting the local clock.
pub fn generate(db: &DbState, secret: &str, branch_id: &str) -> Result<Value, AppError> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| AppError::Database(e.to_string()))?;

    let known: Option<i64> = conn
        .query_row(
            "SELECT is_active FROM branches WHERE id = ?1",
            params![branch_id],
            |row| row.get(0),
        )
        .optional()?;
    match known {
        None => return Err(AppError::BadRequest(format!("Unknown branch {branch_id}"))),
        Some(0) => {
            return Err(AppError::BadRequest(format!(
                "Branch {branch_id} is inactive"
            )))
        }
        Some(_) => {}
    }

    let now = Utc::now();
    let (tok, _payload) = token::mint(branch_id, now.timestamp_millis(), secret);
    let expires_at = now + Duration::milliseconds(token::TOKEN_TTL_MS);

    purge_stale_tokens(&conn, now);

    conn.execute(
        "INSERT INTO attendance_tokens (id, branch_id, token, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::new_v4().to_string(),
            branch_id,
            tok,
            expires_at.to_rfc3339(),
            now.to_rfc3339()
        ],
    )?;

    info!(branch_id, "attendance token minted");

    Ok(json!({
        "token": tok,
        "expiresAt": expires_at.to_rfc3339(),
        "serverTime": now.to_rfc3339(),
    }))
}

/// Drop unused token records long past expiry; consumed records stay for
/// audit. Best-effort, runs piggybacked on `generate`.
fn purge_stale_tokens(conn: &Connection, now: chrono::DateTime<Utc>) {
    let cutoff = (now - Duration::hours(TOKEN_RETENTION_HOURS)).to_rfc3339();
    match conn.execute(
        "DELETE FROM attendance_tokens WHERE used_at IS NULL AND expires_at < ?1",
        params![cutoff],
    ) {
        Ok(0) => {}
        Ok(n) => info!(purged = n, "purged stale attendance tokens"),
        Err(e) => warn!(error = %e, "failed to purge stale attendance tokens"),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// Signature and freshness check only; single-use enforcement belongs to
/// clock-in, where the record is consumed.
pub fn validate(secret: &str, tok: &str) -> Value {
    match token::validate(tok, token::now_ms(), secret) {
        Ok(claims) => json!({ "valid": true, "branchId": claims.branch_id }),
        Err(e) => json!({ "valid": false, "error": e.code(), "message": e.to_string() }),
    }
}

// ---------------------------------------------------------------------------
// clock-in
// ---------------------------------------------------------------------------

enum Outcome {
    Commit(Value),
    Reject(Value),
}

/// Validate and consume `tok`, verify `pin`, and open or close today's
/// attendance record for the matched staff member.
pub fn clock_in(
    db: &DbState,
    secret: &str,
    tok: &str,
    pin: &str,
    photo_url: Option<&str>,
    requester_ip: Option<&str>,
) -> Result<Value, AppError> {
    let claims = match token::validate(tok, token::now_ms(), secret) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = e.code(), "clock-in rejected: token validation failed");
            return Ok(token_error(&e));
        }
    };

    let conn = db
        .conn
        .lock()
        .map_err(|e| AppError::Database(e.to_string()))?;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| AppError::Database(format!("begin transaction: {e}")))?;

    let result = run_clock_in(&conn, &claims.branch_id, tok, pin, photo_url, requester_ip);

    match result {
        Ok(Outcome::Commit(value)) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| AppError::Database(format!("commit: {e}")))?;
            Ok(value)
        }
        Ok(Outcome::Reject(value)) => {
            let _ = conn.execute_batch("ROLLBACK");
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn run_clock_in(
    conn: &Connection,
    branch_id: &str,
    tok: &str,
    pin: &str,
    photo_url: Option<&str>,
    requester_ip: Option<&str>,
) -> Result<Outcome, AppError> {
    let record: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, used_at FROM attendance_tokens WHERE token = ?1",
            params![tok],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (token_id, used_at) = match record {
        Some(r) => r,
        None => {
            return Ok(Outcome::Reject(domain_error(
                "UNKNOWN_TOKEN",
                "Code is not registered with this server",
            )))
        }
    };
    if used_at.is_some() {
        warn!(branch_id, "clock-in rejected: token already used");
        return Ok(Outcome::Reject(domain_error(
            "TOKEN_USED",
            "Code has already been used, scan a fresh one",
        )));
    }

    let staff = match auth::verify_branch_pin(conn, branch_id, pin)? {
        Some(s) => s,
        None => {
            warn!(branch_id, "clock-in rejected: PIN did not match any staff");
            return Ok(Outcome::Reject(domain_error(
                "WRONG_PIN",
                "PIN does not match any staff member of this branch",
            )));
        }
    };

    let local = Local::now();
    let work_date = local.format("%Y-%m-%d").to_string();
    let now = Utc::now().to_rfc3339();

    let open: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance_records
             WHERE staff_id = ?1 AND branch_id = ?2 AND work_date = ?3 AND check_out IS NULL",
            params![staff.id, branch_id, work_date],
            |row| row.get(0),
        )
        .optional()?;

    let action = match open {
        None => {
            conn.execute(
                "INSERT INTO attendance_records (
                    id, staff_id, branch_id, work_date, check_in, check_in_ip,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    staff.id,
                    branch_id,
                    work_date,
                    now,
                    requester_ip
                ],
            )?;
            "check_in"
        }
        Some(record_id) => {
            conn.execute(
                "UPDATE attendance_records
                 SET check_out = ?1,
                     check_out_ip = ?2,
                     selfie_url = COALESCE(?3, selfie_url),
                     updated_at = ?1
                 WHERE id = ?4",
                params![now, requester_ip, photo_url, record_id],
            )?;
            "check_out"
        }
    };

    // Consume the token last; the used_at guard closes the gap between the
    // check above and this write if another connection raced us.
    let consumed = conn.execute(
        "UPDATE attendance_tokens SET used_at = ?1, used_by = ?2
         WHERE id = ?3 AND used_at IS NULL",
        params![now, staff.id, token_id],
    )?;
    if consumed == 0 {
        warn!(branch_id, "clock-in rejected: token consumed concurrently");
        return Ok(Outcome::Reject(domain_error(
            "TOKEN_USED",
            "Code has already been used, scan a fresh one",
        )));
    }

    info!(
        staff_id = %staff.id,
        branch_id,
        action,
        "attendance recorded"
    );

    Ok(Outcome::Commit(json!({
        "success": true,
        "action": action,
        "staffName": staff.display_name,
        "localTime": local.format("%H:%M:%S").to_string(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::{seed_branch, seed_staff, test_state};

    const SECRET: &str = "test-signing-secret";

    fn seeded_db() -> DbState {
        let db = test_state();
        {
            let conn = db.conn.lock().unwrap();
            seed_branch(&conn, "b1", "Centro");
            seed_branch(&conn, "b2", "Norte");
            seed_staff(&conn, "staff-1", "b1", "Ana", false, Some("2468"));
        }
        db
    }

    fn fresh_token(db: &DbState, branch_id: &str) -> String {
        let result = generate(db, SECRET, branch_id).expect("generate token");
        result["token"].as_str().unwrap().to_string()
    }

    #[test]
    fn generate_rejects_unknown_branch() {
        let db = seeded_db();
        let err = generate(&db, SECRET, "ghost").expect_err("unknown branch");
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn generated_token_round_trips_through_validate() {
        let db = seeded_db();
        let tok = fresh_token(&db, "b1");

        let result = validate(SECRET, &tok);
        assert_eq!(result["valid"], true);
        assert_eq!(result["branchId"], "b1");
    }

    #[test]
    fn clock_in_then_out_toggles_and_consumes_tokens() {
        let db = seeded_db();

        let tok = fresh_token(&db, "b1");
        let first = clock_in(&db, SECRET, &tok, "2468", None, Some("10.0.0.9")).unwrap();
        assert_eq!(first["success"], true);
        assert_eq!(first["action"], "check_in");
        assert_eq!(first["staffName"], "Ana");
        assert!(first["localTime"].as_str().is_some());

        // Same token again: consumed.
        let replay = clock_in(&db, SECRET, &tok, "2468", None, None).unwrap();
        assert_eq!(replay["success"], false);
        assert_eq!(replay["error"], "TOKEN_USED");

        // A fresh token the same day closes the open record.
        let tok2 = fresh_token(&db, "b1");
        let second = clock_in(&db, SECRET, &tok2, "2468", Some("https://cdn/x.jpg"), None).unwrap();
        assert_eq!(second["action"], "check_out");

        let conn = db.conn.lock().unwrap();
        let (check_out, selfie, ip): (Option<String>, Option<String>, Option<String>) = conn
            .query_row(
                "SELECT check_out, selfie_url, check_in_ip FROM attendance_records
                 WHERE staff_id = 'staff-1'",
                params![],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert!(check_out.is_some());
        assert_eq!(selfie.as_deref(), Some("https://cdn/x.jpg"));
        assert_eq!(ip.as_deref(), Some("10.0.0.9"));

        let used: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM attendance_tokens WHERE used_by = 'staff-1'",
                params![],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(used, 2);
    }

    #[test]
    fn wrong_pin_is_a_domain_error_and_keeps_the_token_unused() {
        let db = seeded_db();
        let tok = fresh_token(&db, "b1");

        let result = clock_in(&db, SECRET, &tok, "9999", None, None).unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "WRONG_PIN");

        // The rejected attempt must not burn the code.
        let retry = clock_in(&db, SECRET, &tok, "2468", None, None).unwrap();
        assert_eq!(retry["success"], true);
    }

    #[test]
    fn cross_branch_pin_does_not_match() {
        let db = seeded_db();
        // staff-1's PIN belongs to b1; a b2 code must not accept it.
        let tok = fresh_token(&db, "b2");
        let result = clock_in(&db, SECRET, &tok, "2468", None, None).unwrap();
        assert_eq!(result["error"], "WRONG_PIN");
    }

    #[test]
    fn signed_but_unregistered_token_is_rejected() {
        let db = seeded_db();
        let (tok, _) = token::mint("b1", token::now_ms(), SECRET);
        let result = clock_in(&db, SECRET, &tok, "2468", None, None).unwrap();
        assert_eq!(result["error"], "UNKNOWN_TOKEN");
    }

    #[test]
    fn tampered_token_is_rejected_before_touching_the_db() {
        let db = seeded_db();
        let tok = fresh_token(&db, "b1");
        let tampered = format!("{}x", &tok[..tok.len() - 1]);

        let result = clock_in(&db, SECRET, &tampered, "2468", None, None).unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "INVALID_SIGNATURE");
    }

    #[test]
    fn purge_drops_only_expired_unused_tokens() {
        let db = seeded_db();
        {
            let conn = db.conn.lock().unwrap();
            let long_ago = (Utc::now() - Duration::hours(48)).to_rfc3339();
            conn.execute(
                "INSERT INTO attendance_tokens (id, branch_id, token, expires_at)
                 VALUES ('t-old', 'b1', 'stale.aaaa', ?1)",
                params![long_ago],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO attendance_tokens (id, branch_id, token, expires_at, used_at, used_by)
                 VALUES ('t-used', 'b1', 'used.bbbb', ?1, ?1, 'staff-1')",
                params![long_ago],
            )
            .unwrap();
        }

        // generate() piggybacks the purge.
        fresh_token(&db, "b1");

        let conn = db.conn.lock().unwrap();
        let stale: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM attendance_tokens WHERE id = 't-old'",
                params![],
                |row| row.get(0),
            )
            .unwrap();
        let audited: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM attendance_tokens WHERE id = 't-used'",
                params![],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stale, 0, "expired unused token should be purged");
        assert_eq!(audited, 1, "consumed token stays for audit");
    }
}
