//! Configuration and session storage

pub mod storage;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use storage::{FileStorage, KeyValueStore, MemoryStorage};

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "session-keeper", "session-keeper")
        .context("Could not determine config directory")
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the backend API (refresh and business endpoints hang off it)
    pub api_base_url: String,
    /// Override for the session file location
    pub storage_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub gate: GateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            storage_path: None,
            scheduler: SchedulerConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

/// Proactive refresh timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long before expiry the proactive refresh fires
    pub lead_time_ms: u64,
    /// Upper bound of the random spread subtracted from the fire time
    pub jitter_ms: u64,
    /// Floor on any armed delay
    pub min_delay_ms: u64,
    pub max_proactive_retries: u32,
    /// Backoff base; attempt `n` waits `base * 2^n`
    pub retry_delay_base_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lead_time_ms: 60_000,
            jitter_ms: 5_000,
            min_delay_ms: 1_000,
            max_proactive_retries: 3,
            retry_delay_base_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub fn lead_time(&self) -> Duration {
        Duration::from_millis(self.lead_time_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Backoff before retry number `attempt + 1`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_delay_base_ms.saturating_mul(factor))
    }
}

/// Request gate behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Auth-flow endpoints that never carry a bearer token and never trigger a refresh
    pub excluded_paths: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            excluded_paths: [
                "/auth/login",
                "/auth/register",
                "/auth/refresh",
                "/auth/forgot-password",
                "/auth/reset-password",
                "/auth/2fa/setup",
                "/auth/2fa/verify",
                "/auth/2fa/enable",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Config {
    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    /// Load configuration from `path`; a missing file yields defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Session file location: explicit override or the data directory default
    pub fn storage_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(path.clone()),
            None => FileStorage::default_path(),
        }
    }
}
