//! TOML configuration for testrollup.
//!
//! Layered: an explicit path, then the `TESTROLLUP_CONFIG` environment
//! variable, then `./testrollup.toml`, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::AggregationSettings;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "TESTROLLUP_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "testrollup.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RollupConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration to use. An explicit path must load; the
    /// environment and local files fall through to defaults on error.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TESTROLLUP_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.database_path.as_os_str().is_empty() {
            bail!("storage.database_path must not be empty");
        }
        if self.aggregation.category_timeout_ms == 0 {
            bail!("aggregation.category_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/testrollup.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Executions running longer than this are flagged as long-running.
    pub long_running_threshold_secs: u64,
    /// Per-category budget when rolling up a whole build.
    pub category_timeout_ms: u64,
    /// Leave suites marked `bug=true` out of group and build totals.
    pub exclude_bug_suites: bool,
    pub cache_enabled: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            long_running_threshold_secs: 300,
            category_timeout_ms: 5_000,
            exclude_bug_suites: true,
            cache_enabled: true,
        }
    }
}

impl AggregationConfig {
    pub fn settings(&self) -> AggregationSettings {
        AggregationSettings {
            long_running_ms: i64::try_from(self.long_running_threshold_secs.saturating_mul(1_000))
                .unwrap_or(i64::MAX),
            exclude_bug_suites: self.exclude_bug_suites,
            category_timeout: Duration::from_millis(self.category_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
