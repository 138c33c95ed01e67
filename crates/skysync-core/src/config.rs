//! Engine configuration.
//!
//! Typed configuration structs that map to the YAML configuration file,
//! with loading, defaults, and per-section tuning knobs for the watcher,
//! retry policy, and transfer concurrency.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub watcher: WatcherConfig,
    pub retry: RetryConfig,
    pub transfers: TransferConfig,
}

/// Filesystem watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Milliseconds a path must stay quiet before its event settles.
    pub debounce_ms: u64,
    /// Capacity of the per-sync event queue; overflow forces a rescan.
    pub queue_capacity: usize,
}

/// Retry/backoff settings for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Seconds before the first retry.
    pub base_delay_secs: u64,
    /// Backoff ceiling in seconds.
    pub max_delay_secs: u64,
    /// Attempts before a transient failure is surfaced as a stall.
    pub max_attempts: u32,
}

impl RetryConfig {
    /// Delay before the given attempt (0-based), exponential and capped.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let secs = self
            .base_delay_secs
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_secs);
        std::time::Duration::from_secs(secs)
    }
}

/// Transfer concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum concurrent uploads per sync.
    pub upload_concurrent: usize,
    /// Maximum concurrent downloads per sync.
    pub download_concurrent: usize,
}

impl EngineConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("skysync")
            .join("config.yaml")
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            queue_capacity: 4096,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 300,
            max_attempts: 8,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_concurrent: 4,
            download_concurrent: 8,
        }
    }
}
