//! Environment-driven service configuration.
//!
//! The token signing secret is mandatory and may be supplied directly
//! (`ATTENDANCE_SIGNING_SECRET`) or as a mounted secret file
//! (`ATTENDANCE_SIGNING_SECRET_FILE`, e.g. `/run/secrets/...`). It is held
//! in zeroizing memory and never logged.

use std::env;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use zeroize::Zeroizing;

const PORT_VAR: &str = "ATTENDANCE_PORT";
const DATA_DIR_VAR: &str = "ATTENDANCE_DATA_DIR";
const LOG_DIR_VAR: &str = "ATTENDANCE_LOG_DIR";
const SECRET_VAR: &str = "ATTENDANCE_SIGNING_SECRET";
const SECRET_FILE_VAR: &str = "ATTENDANCE_SIGNING_SECRET_FILE";
const ADMIN_TOKEN_VAR: &str = "ATTENDANCE_ADMIN_TOKEN";

pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Key for token signing; with bcrypt PIN hashes it is no longer used as
    /// a PIN salt.
    pub signing_secret: Zeroizing<String>,
    /// Grants global-admin access to `set-pin` when presented as the
    /// `x-admin-token` header. Absent means admin access is disabled.
    pub admin_token: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(Self {
            port: try_load(PORT_VAR, "8787")?,
            data_dir: PathBuf::from(var_or(DATA_DIR_VAR, "data")),
            log_dir: PathBuf::from(var_or(LOG_DIR_VAR, "logs")),
            signing_secret: load_signing_secret()?,
            admin_token: env::var(ADMIN_TOKEN_VAR)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    let raw = var_or(key, default);
    match raw.parse() {
        Ok(v) => Ok(v),
        Err(e) => bail!("invalid {key} value {raw:?}: {e}"),
    }
}

fn load_signing_secret() -> Result<Zeroizing<String>> {
    if let Ok(direct) = env::var(SECRET_VAR) {
        let trimmed = direct.trim();
        if !trimmed.is_empty() {
            return Ok(Zeroizing::new(trimmed.to_string()));
        }
    }
    if let Ok(path) = env::var(SECRET_FILE_VAR) {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read signing secret file {path}"))?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("signing secret file {path} is empty");
        }
        return Ok(Zeroizing::new(trimmed.to_string()));
    }
    bail!("{SECRET_VAR} (or {SECRET_FILE_VAR}) must be set")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            PORT_VAR,
            DATA_DIR_VAR,
            LOG_DIR_VAR,
            SECRET_VAR,
            SECRET_FILE_VAR,
            ADMIN_TOKEN_VAR,
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_only_secret_is_set() {
        clear_env();
        env::set_var(SECRET_VAR, "s3cret");

        let config = Config::load().expect("config should load");
        assert_eq!(config.port, 8787);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.signing_secret.as_str(), "s3cret");
        assert!(config.admin_token.is_none());
    }

    #[test]
    #[serial]
    fn missing_secret_is_a_startup_error() {
        clear_env();
        assert!(Config::load().is_err());
    }

    #[test]
    #[serial]
    fn invalid_port_is_rejected() {
        clear_env();
        env::set_var(SECRET_VAR, "s3cret");
        env::set_var(PORT_VAR, "not-a-port");
        assert!(Config::load().is_err());
    }

    #[test]
    #[serial]
    fn secret_file_is_trimmed() {
        clear_env();
        let dir = std::env::temp_dir().join("attendance-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("signing_secret");
        fs::write(&path, "  file-secret\n").unwrap();

        env::set_var(SECRET_FILE_VAR, &path);
        env::set_var(ADMIN_TOKEN_VAR, "ops-token");

        let config = Config::load().expect("config should load");
        assert_eq!(config.signing_secret.as_str(), "file-secret");
        assert_eq!(config.admin_token.as_deref(), Some("ops-token"));
    }
}
