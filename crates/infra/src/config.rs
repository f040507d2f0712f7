//! Configuration loading and representation.
//!
//! Everything is read from environment variables into typed structs. Unset
//! variables fall back to defaults; set-but-invalid values are errors.

use std::time::Duration;

use thiserror::Error;

pub const LOCK_TIMEOUT_VAR: &str = "KEEL_LOCK_TIMEOUT_MS";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const MAX_CONNECTIONS_VAR: &str = "KEEL_DB_MAX_CONNECTIONS";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Apply engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplierConfig {
    /// Upper bound on waiting for an aggregate row lock.
    pub lock_timeout: Duration,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl ApplierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lock_timeout = match lookup(LOCK_TIMEOUT_VAR) {
            Some(raw) => Duration::from_millis(parse_positive(LOCK_TIMEOUT_VAR, &raw)?),
            None => DEFAULT_LOCK_TIMEOUT,
        };
        Ok(Self { lock_timeout })
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

/// Record store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Postgres connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup(DATABASE_URL_VAR).filter(|url| !url.trim().is_empty());

        let max_connections = match lookup(MAX_CONNECTIONS_VAR) {
            Some(raw) => {
                let n = parse_positive(MAX_CONNECTIONS_VAR, &raw)?;
                u32::try_from(n).map_err(|_| ConfigError::Invalid {
                    var: MAX_CONNECTIONS_VAR,
                    expected: "a positive 32-bit integer",
                    value: raw,
                })?
            }
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Self {
            database_url,
            max_connections,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.database_url.is_some()
    }
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::Invalid {
            var,
            expected: "a positive integer",
            value: raw.to_string(),
        })
}
