//! Storage layer configuration.
//!
//! # Validation Rules
//!
//! - `partition_size` must be >= 1
//! - `max_open_partitions` must be >= 2 (the hot partition plus at least one
//!   evictable slot)
//! - `cache_size_bytes` must be >= 1 MB (1,048,576 bytes)
//! - `retention_window` must be >= `partition_size`
//!
//! # Example
//!
//! ```no_run
//! # use strata_types::config::StorageConfig;
//! let config = StorageConfig::builder()
//!     .partition_size(1000)
//!     .max_open_partitions(20)
//!     .build()
//!     .expect("valid storage config");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Minimum cache size: 1 MB.
const MIN_CACHE_SIZE_BYTES: usize = 1024 * 1024;

/// Configuration error types.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A value was out of its valid range.
    #[snafu(display("Invalid configuration: {message}"))]
    Validation {
        /// What was out of range.
        message: String,
    },
}

/// Which partition backend the engine should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Probe the data directory and pick a suitable backend.
    #[default]
    Auto,
    /// On-disk partitions, one store file per partition directory.
    File,
    /// In-memory partitions; used for tests and ephemeral nodes.
    Memory,
}

/// Storage layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Number of block heights covered by one partition.
    #[serde(default = "default_partition_size")]
    pub partition_size: u64,
    /// Maximum number of simultaneously open partitions.
    #[serde(default = "default_max_open_partitions")]
    pub max_open_partitions: usize,
    /// Seconds of inactivity after which a partition may be closed.
    #[serde(default = "default_idle_close_secs")]
    pub idle_close_secs: u64,
    /// Total cache budget in bytes, divided across open partitions.
    #[serde(default = "default_cache_size")]
    pub cache_size_bytes: usize,
    /// Whether this node keeps full block history (disables redaction).
    #[serde(default = "default_store_full_history")]
    pub store_full_history: bool,
    /// Compact every on-disk partition before serving, at startup.
    #[serde(default)]
    pub optimize_storage: bool,
    /// Free-disk-space floor below which no new partition may be opened.
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,
    /// Number of recent heights whose partitions are kept open and whose
    /// blocks a redacting node guarantees to retain.
    #[serde(default = "default_retention_window")]
    pub retention_window: u64,
    /// Seconds between background maintenance sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Partition backend selection.
    #[serde(default)]
    pub backend: BackendChoice,
}

#[bon::bon]
impl StorageConfig {
    /// Creates a new storage configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_partition_size())] partition_size: u64,
        #[builder(default = default_max_open_partitions())] max_open_partitions: usize,
        #[builder(default = default_idle_close_secs())] idle_close_secs: u64,
        #[builder(default = default_cache_size())] cache_size_bytes: usize,
        #[builder(default = default_store_full_history())] store_full_history: bool,
        #[builder(default)] optimize_storage: bool,
        #[builder(default = default_min_free_disk_bytes())] min_free_disk_bytes: u64,
        #[builder(default = default_retention_window())] retention_window: u64,
        #[builder(default = default_sweep_interval_secs())] sweep_interval_secs: u64,
        #[builder(default)] backend: BackendChoice,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            partition_size,
            max_open_partitions,
            idle_close_secs,
            cache_size_bytes,
            store_full_history,
            optimize_storage,
            min_free_disk_bytes,
            retention_window,
            sweep_interval_secs,
            backend,
        };
        config.validate()?;
        Ok(config)
    }
}

impl StorageConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_size == 0 {
            return Err(ConfigError::Validation {
                message: "partition_size must be >= 1".to_string(),
            });
        }
        if self.max_open_partitions < 2 {
            return Err(ConfigError::Validation {
                message: format!(
                    "max_open_partitions must be >= 2, got {}",
                    self.max_open_partitions
                ),
            });
        }
        if self.cache_size_bytes < MIN_CACHE_SIZE_BYTES {
            return Err(ConfigError::Validation {
                message: format!(
                    "cache_size_bytes must be >= {} (1 MB), got {}",
                    MIN_CACHE_SIZE_BYTES, self.cache_size_bytes
                ),
            });
        }
        if self.retention_window < self.partition_size {
            return Err(ConfigError::Validation {
                message: format!(
                    "retention_window must be >= partition_size ({}), got {}",
                    self.partition_size, self.retention_window
                ),
            });
        }
        Ok(())
    }

    /// Idle-close timeout as a [`Duration`].
    pub fn idle_close(&self) -> Duration {
        Duration::from_secs(self.idle_close_secs)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            partition_size: default_partition_size(),
            max_open_partitions: default_max_open_partitions(),
            idle_close_secs: default_idle_close_secs(),
            cache_size_bytes: default_cache_size(),
            store_full_history: default_store_full_history(),
            optimize_storage: false,
            min_free_disk_bytes: default_min_free_disk_bytes(),
            retention_window: default_retention_window(),
            sweep_interval_secs: default_sweep_interval_secs(),
            backend: BackendChoice::Auto,
        }
    }
}

fn default_partition_size() -> u64 {
    1000
}

fn default_max_open_partitions() -> usize {
    50
}

fn default_idle_close_secs() -> u64 {
    60
}

fn default_cache_size() -> usize {
    256 * 1024 * 1024 // 256 MB
}

fn default_store_full_history() -> bool {
    true
}

fn default_min_free_disk_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GB
}

fn default_retention_window() -> u64 {
    20_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}
