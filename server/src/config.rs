//! Configuration management for the server.

use std::env;
use ward_engine::SyncConfig;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Pool size
    pub max_connections: u32,
    /// Engine settings
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS"))?,
            None => 10,
        };

        let defaults = SyncConfig::default();
        let read_only = match lookup("SYNC_READ_ONLY") {
            Some(value) => parse_flag("SYNC_READ_ONLY", &value)?,
            None => defaults.read_only,
        };
        let revivable_types = lookup("SYNC_REVIVABLE_TYPES")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.revivable_types);
        let session_timeout_ms = match lookup("SYNC_SESSION_TIMEOUT_MS") {
            Some(value) => parse_millis("SYNC_SESSION_TIMEOUT_MS", &value)?,
            None => defaults.session_timeout_ms,
        };
        let lapsed_session_ms = match lookup("SYNC_LAPSED_SESSION_MS") {
            Some(value) => parse_millis("SYNC_LAPSED_SESSION_MS", &value)?,
            None => defaults.lapsed_session_ms,
        };

        Ok(Self {
            host,
            port,
            database_url,
            max_connections,
            sync: SyncConfig {
                read_only,
                revivable_types,
                session_timeout_ms,
                lapsed_session_ms,
            },
        })
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue(key)),
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}
