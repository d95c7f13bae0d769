//! Live engine tunables.
//!
//! Every worker re-reads its [`ConfigSource`] at the top of each main-loop iteration, so
//! operators can retune a running fleet without restarting it. Keys are flat; the legacy
//! `SCRAPER_*` names are accepted as aliases.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::coordination::{CoordError, Coordinator};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Coordination error while loading configuration: {0}")]
    Coordination(#[from] CoordError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(alias = "SCRAPER_BATCH_SIZE")]
    pub batch_size: u64,
    #[serde(alias = "SCRAPER_WRITE_BATCH_SIZE")]
    pub write_batch_size: usize,
    #[serde(alias = "SCRAPER_CONSECUTIVE_ERROR_LIMIT")]
    pub consecutive_not_found_limit: u64,
    #[serde(alias = "SCRAPER_PAUSE_DURATION_MS")]
    pub pause_duration_ms: u64,
    #[serde(alias = "SCRAPER_PARALLEL_REQUEST_LIMIT_MIN")]
    pub concurrency_min: usize,
    #[serde(alias = "SCRAPER_PARALLEL_REQUEST_LIMIT_MAX")]
    pub concurrency_max: usize,
    #[serde(alias = "SCRAPER_ADAPTIVE_DELAY_MIN_MS")]
    pub delay_min_ms: u64,
    #[serde(alias = "SCRAPER_ADAPTIVE_DELAY_MAX_MS")]
    pub delay_max_ms: u64,
    #[serde(alias = "SCRAPER_ADAPTIVE_DELAY_STEP_MS")]
    pub delay_step_ms: u64,
    #[serde(alias = "SCRAPER_DELAY_COMPENSATION_MS")]
    pub delay_compensation_ms: u64,
    #[serde(alias = "SCRAPER_SUCCESS_STREAK_TO_INCREASE_LIMIT")]
    pub success_streak_to_increase: u32,
    #[serde(alias = "SCRAPER_ANALYSIS_WINDOW")]
    pub analysis_window: usize,
    /// Percent, 0-100.
    #[serde(alias = "SCRAPER_SUCCESS_THRESHOLD")]
    pub success_threshold: f64,
    #[serde(alias = "SCRAPER_INTEGRITY_CHECK_BATCH_SIZE")]
    pub integrity_batch_size: u64,
    #[serde(alias = "SCRAPER_RECENT_PROFILES_LIMIT")]
    pub recent_profiles_limit: usize,
    #[serde(alias = "SCRAPER_TARGET_GOAL")]
    pub target_goal: u64,
    pub pause_poll_ms: u64,
    pub integrity_poll_ms: u64,
    pub idle_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            write_batch_size: 50,
            consecutive_not_found_limit: 100,
            pause_duration_ms: 6 * 60 * 60 * 1000, // 6 hours
            concurrency_min: 1,
            concurrency_max: 10,
            delay_min_ms: 500,
            delay_max_ms: 10_000,
            delay_step_ms: 100,
            delay_compensation_ms: 10,
            success_streak_to_increase: 3,
            analysis_window: 200,
            success_threshold: 99.0,
            integrity_batch_size: 50_000,
            recent_profiles_limit: 100,
            target_goal: 17_000_000,
            pause_poll_ms: 60_000,
            integrity_poll_ms: 5_000,
            idle_poll_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// Reject values the worker loop cannot run with. Callers treat this as fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.write_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "write_batch_size must be at least 1".into(),
            ));
        }
        if self.consecutive_not_found_limit == 0 {
            return Err(ConfigError::Invalid(
                "consecutive_not_found_limit must be at least 1".into(),
            ));
        }
        if self.concurrency_min == 0 || self.concurrency_min > self.concurrency_max {
            return Err(ConfigError::Invalid(format!(
                "concurrency bounds must satisfy 1 <= min <= max (got {}..{})",
                self.concurrency_min, self.concurrency_max
            )));
        }
        if self.delay_min_ms > self.delay_max_ms {
            return Err(ConfigError::Invalid(format!(
                "delay_min_ms ({}) exceeds delay_max_ms ({})",
                self.delay_min_ms, self.delay_max_ms
            )));
        }
        if self.analysis_window == 0 {
            return Err(ConfigError::Invalid(
                "analysis_window must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.success_threshold) {
            return Err(ConfigError::Invalid(format!(
                "success_threshold must be a percentage, got {}",
                self.success_threshold
            )));
        }
        if self.integrity_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "integrity_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_millis(self.pause_duration_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn integrity_poll(&self) -> Duration {
        Duration::from_millis(self.integrity_poll_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Parse a flat JSON object, filling unspecified keys with defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }
}

/// Where a worker gets its tunables from. Loaded once per main-loop iteration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<EngineConfig, ConfigError>;
}

/// Fixed configuration, used by tests and one-off runs.
#[derive(Debug, Clone)]
pub struct StaticConfigSource {
    config: EngineConfig,
}

impl StaticConfigSource {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config.clone())
    }
}

/// JSON file re-read on every load so edits take effect on the next iteration.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<EngineConfig, ConfigError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })?;
        EngineConfig::from_json(&raw)
    }
}

/// Fleet-wide configuration kept as a JSON blob in the coordination store.
/// Falls back to defaults while nothing has been pushed.
#[derive(Clone)]
pub struct StoreConfigSource {
    coordinator: Coordinator,
}

impl StoreConfigSource {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ConfigSource for StoreConfigSource {
    async fn load(&self) -> Result<EngineConfig, ConfigError> {
        match self.coordinator.config_blob().await? {
            Some(raw) => EngineConfig::from_json(&raw),
            None => Ok(EngineConfig::default()),
        }
    }
}
