//! Sync engine configuration
//!
//! # Config Format
//!
//! ```toml
//! sync_interval_ms = 100
//! max_batch_size = 64
//! max_send_attempts = 3
//! immediate_send = true
//! coalesce_partials = true
//! host_serves_snapshots = true
//! object_id_prefix = "obj"
//! ```
//!
//! Every key is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration for a [`SyncEngine`](crate::SyncEngine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sync loop period in milliseconds
    pub sync_interval_ms: u64,
    /// Maximum pending changes flushed per tick
    pub max_batch_size: usize,
    /// Send attempts per pending change before it is dropped
    pub max_send_attempts: u32,
    /// Send local changes as they happen instead of on the next tick
    pub immediate_send: bool,
    /// Fold queued transform/material changes for the same object together
    pub coalesce_partials: bool,
    /// Answer `request-scene-sync` with a snapshot while we are host
    pub host_serves_snapshots: bool,
    /// Prefix for generated object IDs
    pub object_id_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 100,
            max_batch_size: 64,
            max_send_attempts: 3,
            immediate_send: true,
            coalesce_partials: true,
            host_serves_snapshots: true,
            object_id_prefix: "obj".to_string(),
        }
    }
}

impl SyncConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sync_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "sync_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Validation(
                "max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.object_id_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "object_id_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Sync loop period
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_send_attempts(mut self, attempts: u32) -> Self {
        self.max_send_attempts = attempts;
        self
    }

    pub fn with_immediate_send(mut self, enabled: bool) -> Self {
        self.immediate_send = enabled;
        self
    }

    pub fn with_coalesce_partials(mut self, enabled: bool) -> Self {
        self.coalesce_partials = enabled;
        self
    }

    pub fn with_host_serves_snapshots(mut self, enabled: bool) -> Self {
        self.host_serves_snapshots = enabled;
        self
    }

    pub fn with_object_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.object_id_prefix = prefix.into();
        self
    }
}
