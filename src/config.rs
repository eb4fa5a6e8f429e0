//! Control Plane Configuration
//!
//! Loaded from a JSON file. Every field has a default, so an empty object
//! is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::errors::ErrorClass;

/// Result type for configuration handling
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(String),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "TOPO_CONFIG_IO",
            ConfigError::Parse(_) => "TOPO_CONFIG_PARSE",
            ConfigError::Invalid { .. } => "TOPO_CONFIG_INVALID",
        }
    }

    /// Always `Infrastructure`.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Infrastructure
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Directory holding the topology snapshot and migration jobs
    /// (default: "./topoplane-data")
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Side-effect outbox settings
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Topology mutation settings
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Migration orchestration settings
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Side-effect outbox settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Failed deliveries before a record is dead-lettered (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Topology mutation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// How long a replication rebuild window may stay open before it is
    /// reported as overdue (default: 86400)
    #[serde(default = "default_rebuild_window_secs")]
    pub rebuild_window_secs: u64,

    /// Privileged accounts whose passwords are deleted when a storage
    /// instance is decommissioned
    #[serde(default = "default_privileged_usernames")]
    pub privileged_usernames: Vec<String>,
}

/// Migration orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Scheduler interval between `advance()` calls (default: 30)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Concurrent copies per source host (default: 10)
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Concurrent copies per source host for engines with a large
    /// per-instance footprint (default: 3)
    #[serde(default = "default_large_footprint_concurrency")]
    pub large_footprint_concurrency: usize,

    /// Required free disk on a source host, as a multiple of the data it
    /// holds (default: 1.5)
    #[serde(default = "default_disk_headroom_ratio")]
    pub disk_headroom_ratio: f64,

    /// No task progress for this long flags a job as stalled
    /// (default: 3600)
    #[serde(default = "default_stall_after_secs")]
    pub stall_after_secs: u64,

    /// Internal kvstores per instance for engines that shard internally
    /// (default: 10)
    #[serde(default = "default_store_units")]
    pub store_units: u32,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./topoplane-data")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_rebuild_window_secs() -> u64 {
    86_400
}

fn default_privileged_usernames() -> Vec<String> {
    vec!["admin".to_string(), "repl".to_string(), "monitor".to_string()]
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    10
}

fn default_large_footprint_concurrency() -> usize {
    3
}

fn default_disk_headroom_ratio() -> f64 {
    1.5
}

fn default_stall_after_secs() -> u64 {
    3600
}

fn default_store_units() -> u32 {
    10
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            outbox: OutboxConfig::default(),
            topology: TopologyConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            rebuild_window_secs: default_rebuild_window_secs(),
            privileged_usernames: default_privileged_usernames(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            default_concurrency: default_concurrency(),
            large_footprint_concurrency: default_large_footprint_concurrency(),
            disk_headroom_ratio: default_disk_headroom_ratio(),
            stall_after_secs: default_stall_after_secs(),
            store_units: default_store_units(),
        }
    }
}

impl ControlPlaneConfig {
    /// Config with the given data directory and defaults elsewhere.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let raw = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, raw).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject values the engines cannot work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.outbox.max_attempts == 0 {
            return Err(ConfigError::invalid("outbox.max_attempts", "must be at least 1"));
        }
        if self.topology.rebuild_window_secs == 0 {
            return Err(ConfigError::invalid("topology.rebuild_window_secs", "must be positive"));
        }

        let m = &self.migration;
        if m.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("migration.poll_interval_secs", "must be positive"));
        }
        if m.default_concurrency == 0 {
            return Err(ConfigError::invalid("migration.default_concurrency", "must be at least 1"));
        }
        if m.large_footprint_concurrency == 0 {
            return Err(ConfigError::invalid(
                "migration.large_footprint_concurrency",
                "must be at least 1",
            ));
        }
        if m.large_footprint_concurrency > m.default_concurrency {
            return Err(ConfigError::invalid(
                "migration.large_footprint_concurrency",
                format!("{} exceeds default_concurrency {}", m.large_footprint_concurrency, m.default_concurrency),
            ));
        }
        if m.disk_headroom_ratio.is_nan() || m.disk_headroom_ratio < 1.0 {
            return Err(ConfigError::invalid(
                "migration.disk_headroom_ratio",
                format!("{} is below 1.0", m.disk_headroom_ratio),
            ));
        }
        if m.stall_after_secs <= m.poll_interval_secs {
            return Err(ConfigError::invalid(
                "migration.stall_after_secs",
                "must be longer than poll_interval_secs",
            ));
        }
        if m.store_units == 0 {
            return Err(ConfigError::invalid("migration.store_units", "must be at least 1"));
        }
        Ok(())
    }
}
