//! Trigger engine configuration
//!
//! Defaults can be overridden from environment variables (`TRIGX_*`) or a
//! JSON file.

use crate::error::TrigxResult;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const ENV_ENABLED: &str = "TRIGX_TRIGGER_ENABLED";
pub const ENV_REFRESH_MS: &str = "TRIGX_TRIGGER_REFRESH_MS";
pub const ENV_ASYNC_POOL_SIZE: &str = "TRIGX_TRIGGER_ASYNC_POOL_SIZE";
pub const ENV_RETRY_WINDOW_MS: &str = "TRIGX_STORE_RETRY_WINDOW_MS";

/// Trigger engine settings shared by every coordinator in a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Master switch; administrative calls fail when off
    pub enabled: bool,
    /// Period of the refresh poll
    pub refresh_interval_ms: u64,
    /// Delay before the first refresh poll
    pub initial_refresh_delay_ms: u64,
    /// Worker threads for deferred (`afterAsync`) triggers
    pub async_pool_size: usize,
    /// Compare-and-swap attempts per cache refresh
    pub cache_refresh_attempts: u32,
    /// Backoff for system store I/O
    pub retry: RetryPolicy,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_ms: 60_000,
            initial_refresh_delay_ms: 60_000,
            async_pool_size: num_cpus::get().max(1),
            cache_refresh_attempts: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl TriggerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn initial_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.initial_refresh_delay_ms)
    }

    /// Defaults overridden by any `TRIGX_*` variables present.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_ENABLED) {
            config.enabled = value.eq_ignore_ascii_case("true") || value == "1";
        }
        if let Some(ms) = lookup(ENV_REFRESH_MS).and_then(|v| v.parse::<u64>().ok()) {
            config.refresh_interval_ms = ms;
            config.initial_refresh_delay_ms = ms;
        }
        if let Some(size) = lookup(ENV_ASYNC_POOL_SIZE).and_then(|v| v.parse::<usize>().ok()) {
            config.async_pool_size = size.max(1);
        }
        if let Some(ms) = lookup(ENV_RETRY_WINDOW_MS).and_then(|v| v.parse::<u64>().ok()) {
            config.retry.max_elapsed_ms = ms;
        }
        config
    }

    /// Load from a JSON file; missing keys keep their defaults.
    pub fn load(path: &Path) -> TrigxResult<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> TrigxResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }
}
