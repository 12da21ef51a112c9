//! Web-seed engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config file.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::TorrentError;

fn default_max_active_tasks() -> usize {
    4
}

fn default_max_tasks_per_mirror() -> usize {
    2
}

fn default_split_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_max_splits_per_file() -> usize {
    4
}

fn default_read_buffer() -> usize {
    64 * 1024
}

fn default_socket_timeout_ms() -> u64 {
    5_000
}

/// Tuning knobs for the web-seed engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSeedConfig {
    /// Maximum concurrent tasks per torrent
    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,
    /// Maximum concurrent tasks against a single mirror
    #[serde(default = "default_max_tasks_per_mirror")]
    pub max_tasks_per_mirror: usize,
    /// Minimum bytes a task keeps after a split; a task is split only when
    /// twice this much remains
    #[serde(default = "default_split_threshold")]
    pub split_threshold: u64,
    /// Maximum concurrent tasks against a single file
    #[serde(default = "default_max_splits_per_file")]
    pub max_splits_per_file: usize,
    /// Largest slice of received data handed to the sink in one write
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
    /// Deadline for connecting and for each individual body read
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Mirror cool-down after a failure; defaults to the socket timeout
    #[serde(default)]
    pub quarantine_ms: Option<u64>,
}

impl Default for WebSeedConfig {
    fn default() -> Self {
        Self {
            max_active_tasks: default_max_active_tasks(),
            max_tasks_per_mirror: default_max_tasks_per_mirror(),
            split_threshold: default_split_threshold(),
            max_splits_per_file: default_max_splits_per_file(),
            read_buffer: default_read_buffer(),
            socket_timeout_ms: default_socket_timeout_ms(),
            quarantine_ms: None,
        }
    }
}

impl WebSeedConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading web seed configuration from: {}", path.display());
        let data = std::fs::read_to_string(path)
            .map_err(|e| {
                error!("Failed to read config file '{}': {}", path.display(), e);
                TorrentError::config_error(format!("Failed to read {}: {}", path.display(), e))
            })?;
        let config: Self = serde_json::from_str(&data).map_err(TorrentError::from)?;
        config.validate()?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_active_tasks == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "max_active_tasks").into());
        }
        if self.max_tasks_per_mirror == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "max_tasks_per_mirror").into());
        }
        if self.max_tasks_per_mirror > self.max_active_tasks {
            return Err(TorrentError::config_error_with_field(
                "cannot exceed max_active_tasks",
                "max_tasks_per_mirror",
            )
            .into());
        }
        if self.split_threshold == 0 {
            return Err(TorrentError::config_error_with_field("must be positive", "split_threshold").into());
        }
        if self.max_splits_per_file == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "max_splits_per_file").into());
        }
        if self.read_buffer == 0 {
            return Err(TorrentError::config_error_with_field("must be positive", "read_buffer").into());
        }
        if self.socket_timeout_ms == 0 {
            return Err(TorrentError::config_error_with_field("must be positive", "socket_timeout_ms").into());
        }
        Ok(())
    }

    /// Get the socket timeout
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Get the mirror cool-down
    pub fn quarantine(&self) -> Duration {
        Duration::from_millis(self.quarantine_ms.unwrap_or(self.socket_timeout_ms))
    }

    /// Split threshold expressed in whole pieces, at least one
    pub fn split_threshold_pieces(&self, piece_length: u64) -> u32 {
        self.split_threshold.div_ceil(piece_length.max(1)).max(1) as u32
    }
}
