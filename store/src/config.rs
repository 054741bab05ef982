//! Configuration management for the store.

use docstash_engine::layout::{DEFAULT_DATABASE_NAME, DEFAULT_DATABASE_VERSION};
use std::env;
use std::path::PathBuf;

/// Store configuration, from environment variables or built in code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Name of the database the connection manager opens
    pub database_name: String,
    /// Version the database is opened at
    pub database_version: u32,
    /// Append an intercom record for every committed batch
    pub record_intercom: bool,
    /// Where the demo keeps its memory snapshot between runs
    pub snapshot_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            database_version: DEFAULT_DATABASE_VERSION,
            record_intercom: true,
            snapshot_path: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_name = lookup("DOCSTASH_DB_NAME").unwrap_or(defaults.database_name);
        if database_name.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseName);
        }

        let database_version = match lookup("DOCSTASH_DB_VERSION") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(version) if version > 0 => version,
                _ => return Err(ConfigError::InvalidVersion(raw)),
            },
            None => defaults.database_version,
        };

        let record_intercom = match lookup("DOCSTASH_RECORD_INTERCOM") {
            Some(raw) => parse_flag(&raw).ok_or(ConfigError::InvalidFlag {
                name: "DOCSTASH_RECORD_INTERCOM",
                value: raw,
            })?,
            None => defaults.record_intercom,
        };

        let snapshot_path = lookup("DOCSTASH_SNAPSHOT_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            database_name,
            database_version,
            record_intercom,
            snapshot_path,
        })
    }

    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    pub fn with_database_version(mut self, version: u32) -> Self {
        self.database_version = version;
        self
    }

    pub fn with_record_intercom(mut self, enabled: bool) -> Self {
        self.record_intercom = enabled;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("DOCSTASH_DB_NAME must not be empty")]
    EmptyDatabaseName,

    #[error("Invalid DOCSTASH_DB_VERSION value: {0:?}")]
    InvalidVersion(String),

    #[error("Invalid {name} value: {value:?}")]
    InvalidFlag { name: &'static str, value: String },
}
