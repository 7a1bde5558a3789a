//! Typed settings read from the environment (optionally a `.env` file).

use crate::error::ConfigError;
use std::path::PathBuf;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const SKIP_CHECK_DB_MIGRATED: &str = "SKIP_CHECK_DB_MIGRATED";
pub const MIGRATIONS_DIR: &str = "MIGRATIONS_DIR";
pub const MIGRATION_VERSION_TABLE: &str = "MIGRATION_VERSION_TABLE";
pub const DB_MAX_CONNECTIONS: &str = "DB_MAX_CONNECTIONS";
pub const RETRY_ATTEMPTS: &str = "RETRY_ATTEMPTS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub skip_check_db_migrated: bool,
    /// Directory holding migration scripts.
    pub migrations_dir: PathBuf,
    /// Table recording the applied revision.
    pub version_table: String,
    pub max_connections: u32,
    /// Total attempts per request, first one included.
    pub retry_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: None,
            skip_check_db_migrated: false,
            migrations_dir: PathBuf::from("migrations"),
            version_table: "migration_version".into(),
            max_connections: 5,
            retry_attempts: 3,
        }
    }
}

/// Truthy setting values: `1`, `true`, `yes`, `on`, `y`, `t` (any case).
pub fn asbool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "y" | "t"
    )
}

impl Settings {
    /// Read from the process environment after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self, ConfigError> {
        let map: std::collections::HashMap<&str, &str> = pairs.into_iter().collect();
        Self::from_lookup(|key| map.get(key).map(|v| v.to_string()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let retry_attempts = parse_u32(RETRY_ATTEMPTS, non_empty(RETRY_ATTEMPTS), defaults.retry_attempts)?;
        if retry_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                key: RETRY_ATTEMPTS,
                value: "0".into(),
            });
        }
        Ok(Settings {
            database_url: non_empty(DATABASE_URL),
            skip_check_db_migrated: non_empty(SKIP_CHECK_DB_MIGRATED)
                .map(|v| asbool(&v))
                .unwrap_or(false),
            migrations_dir: non_empty(MIGRATIONS_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.migrations_dir),
            version_table: non_empty(MIGRATION_VERSION_TABLE).unwrap_or(defaults.version_table),
            max_connections: parse_u32(DB_MAX_CONNECTIONS, non_empty(DB_MAX_CONNECTIONS), defaults.max_connections)?,
            retry_attempts,
        })
    }
}

fn parse_u32(key: &'static str, value: Option<String>, default: u32) -> Result<u32, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidSetting { key, value: v }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let s = Settings::from_pairs([]).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn skip_flag_accepts_truthy_strings() {
        for v in ["true", "1", "YES", " on "] {
            let s = Settings::from_pairs([(SKIP_CHECK_DB_MIGRATED, v)]).unwrap();
            assert!(s.skip_check_db_migrated, "{v}");
        }
        let s = Settings::from_pairs([(SKIP_CHECK_DB_MIGRATED, "false")]).unwrap();
        assert!(!s.skip_check_db_migrated);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = Settings::from_pairs([(DB_MAX_CONNECTIONS, "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { key: DB_MAX_CONNECTIONS, .. }));
        let err = Settings::from_pairs([(RETRY_ATTEMPTS, "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { key: RETRY_ATTEMPTS, .. }));
    }

    #[test]
    fn values_are_read() {
        let s = Settings::from_pairs([
            (DATABASE_URL, "postgres://localhost/app"),
            (MIGRATIONS_DIR, "db/migrations"),
            (RETRY_ATTEMPTS, "5"),
        ])
        .unwrap();
        assert_eq!(s.database_url.as_deref(), Some("postgres://localhost/app"));
        assert_eq!(s.migrations_dir, PathBuf::from("db/migrations"));
        assert_eq!(s.retry_attempts, 5);
    }
}
