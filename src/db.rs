//! SQLite persistence for the attendance service.
//!
//! Uses rusqlite with WAL mode, versioned migrations via a `schema_version`
//! table, and a mutex-guarded connection shared across request handlers.
//! Token records and attendance rows are the authoritative state behind
//! single-use enforcement and audit.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared handle to the service database.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/attendance.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;

    let db_path = data_dir.join("attendance.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path).context("database open failed after retry")?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).context("sqlite open")?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .context("pragma setup")?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .context("create schema_version")?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: branches, staff profiles, token records, attendance rows.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- branches this server signs tokens for
        CREATE TABLE IF NOT EXISTS branches (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            timezone TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- staff profiles; pin_hash is bcrypt, NULL until set-pin runs
        CREATE TABLE IF NOT EXISTS staff_profiles (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL REFERENCES branches(id),
            display_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'staff',
            can_manage_staff INTEGER NOT NULL DEFAULT 0,
            pin_hash TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- one row per minted token, kept for audit and single-use enforcement
        CREATE TABLE IF NOT EXISTS attendance_tokens (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL REFERENCES branches(id),
            token TEXT UNIQUE NOT NULL,
            expires_at TEXT NOT NULL,
            used_at TEXT,
            used_by TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- clock-in/out pairs; check_out stays NULL while the day is open
        CREATE TABLE IF NOT EXISTS attendance_records (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL REFERENCES staff_profiles(id),
            branch_id TEXT NOT NULL REFERENCES branches(id),
            work_date TEXT NOT NULL,
            check_in TEXT NOT NULL,
            check_out TEXT,
            check_in_ip TEXT,
            check_out_ip TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_staff_profiles_branch ON staff_profiles(branch_id);
        CREATE INDEX IF NOT EXISTS idx_attendance_records_day
            ON attendance_records(staff_id, branch_id, work_date);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        anyhow::anyhow!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: optional check-out selfie reference.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        ALTER TABLE attendance_records ADD COLUMN selfie_url TEXT;

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        anyhow::anyhow!("migration v2: {e}")
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: schema-level guard against double-booking.
///
/// At most one open (check_out IS NULL) record per staff/branch/day; a
/// concurrent second clock-in hits the unique index instead of inserting a
/// duplicate. Also indexes token expiry for the purge query.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_open_record
            ON attendance_records(staff_id, branch_id, work_date)
            WHERE check_out IS NULL;

        CREATE INDEX IF NOT EXISTS idx_attendance_tokens_expires
            ON attendance_tokens(expires_at);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        anyhow::anyhow!("migration v3: {e}")
    })?;

    info!("Applied migration v3");
    Ok(())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use rusqlite::params;

    /// Fully migrated in-memory database.
    pub fn test_state() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("enable foreign keys");
        run_migrations(&conn).expect("run migrations");
        DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    pub fn seed_branch(conn: &Connection, id: &str, name: &str) {
        conn.execute(
            "INSERT INTO branches (id, name) VALUES (?1, ?2)",
            params![id, name],
        )
        .expect("seed branch");
    }

    /// Insert a staff profile; `pin` is hashed with a low-cost bcrypt round
    /// to keep tests fast.
    pub fn seed_staff(
        conn: &Connection,
        id: &str,
        branch_id: &str,
        display_name: &str,
        can_manage_staff: bool,
        pin: Option<&str>,
    ) {
        let pin_hash = pin.map(|p| bcrypt::hash(p, 4).expect("hash test pin"));
        conn.execute(
            "INSERT INTO staff_profiles (id, branch_id, display_name, can_manage_staff, pin_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, branch_id, display_name, can_manage_staff as i64, pin_hash],
        )
        .expect("seed staff");
    }
}
