//! Queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use docq_infra::{CollectionName, WriteConcern};

pub const ENV_TABLE: &str = "DOCQ_TABLE";
pub const ENV_QUEUE: &str = "DOCQ_QUEUE";
pub const ENV_LEASE_SECS: &str = "DOCQ_LEASE_SECS";
pub const ENV_WRITE_CONCERN: &str = "DOCQ_WRITE_CONCERN";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Invalid configuration value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid config value for {key}: {message}")]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

impl ConfigError {
    fn new(key: &'static str, message: impl Into<String>) -> Self {
        Self {
            key,
            message: message.into(),
        }
    }
}

/// Lease queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Collection (table) holding the job documents.
    pub table: CollectionName,
    /// Queue used when an operation is not given one.
    pub default_queue: String,
    /// Lease length in seconds.
    #[serde(alias = "expire")]
    pub lease_secs: u64,
    pub write_concern: WriteConcern,
    pub database_url: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            table: CollectionName::default(),
            default_queue: "default".to_string(),
            lease_secs: 60,
            write_concern: WriteConcern::default(),
            database_url: None,
        }
    }
}

impl QueueConfig {
    /// Load from `DOCQ_*` environment variables (and `DATABASE_URL`),
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(table) = lookup(ENV_TABLE) {
            config.table = table
                .parse()
                .map_err(|e| ConfigError::new(ENV_TABLE, format!("{e}")))?;
        }
        if let Some(queue) = lookup(ENV_QUEUE) {
            config.default_queue = queue;
        }
        if let Some(secs) = lookup(ENV_LEASE_SECS) {
            config.lease_secs = secs
                .trim()
                .parse()
                .map_err(|e| ConfigError::new(ENV_LEASE_SECS, format!("'{secs}': {e}")))?;
        }
        if let Some(concern) = lookup(ENV_WRITE_CONCERN) {
            config.write_concern = concern
                .parse()
                .map_err(|e| ConfigError::new(ENV_WRITE_CONCERN, format!("{e}")))?;
        }
        config.database_url = lookup(ENV_DATABASE_URL).filter(|url| !url.is_empty());

        config.validate()?;
        Ok(config)
    }

    pub fn with_table(mut self, table: CollectionName) -> Self {
        self.table = table;
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Lease length; truncated to whole seconds.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_secs = lease.as_secs();
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_secs == 0 {
            return Err(ConfigError::new("lease_secs", "lease must be at least one second"));
        }
        if self.default_queue.trim().is_empty() {
            return Err(ConfigError::new("default_queue", "must not be empty"));
        }
        Ok(())
    }
}
