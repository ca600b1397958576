//! Runtime configuration.
//!
//! Every field has a default, so an empty or partial TOML file is valid.
//! Environment variables override file values:
//!
//! * `OCCURRENCE_MAP_WORKER_TIMEOUT_MS`
//! * `OCCURRENCE_MAP_POOL_SIZE`
//! * `OCCURRENCE_MAP_API_URL`

use std::path::Path;
use std::time::Duration;

use occurrence_map_source::SourceConfig;
use occurrence_map_worker::WorkerPool;
use serde::{Deserialize, Serialize};

/// Overrides [`PipelineConfig::worker_timeout_ms`].
pub const ENV_WORKER_TIMEOUT_MS: &str = "OCCURRENCE_MAP_WORKER_TIMEOUT_MS";
/// Overrides [`PipelineConfig::pool_size`].
pub const ENV_POOL_SIZE: &str = "OCCURRENCE_MAP_POOL_SIZE";
/// Overrides [`SourceConfig::api_url`].
pub const ENV_API_URL: &str = "OCCURRENCE_MAP_API_URL";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for [`AppConfig`].
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Which value is wrong and why.
        message: String,
    },
}

/// Coordinator and worker-pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-task worker timeout.
    pub worker_timeout_ms: u64,
    /// Worker count; derived from available parallelism when unset.
    pub pool_size: Option<usize>,
    /// Records per chunk when parsing in-process.
    pub fallback_parse_chunk: usize,
    /// Items between scheduler yields in the coordinate and filter passes.
    pub coordinate_yield_interval: usize,
    /// Buffered progress updates per subscriber.
    pub progress_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_timeout_ms: 60_000,
            pool_size: None,
            fallback_parse_chunk: 100,
            coordinate_yield_interval: 200,
            progress_channel_capacity: 256,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub const fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    /// Builds a worker pool of the configured size.
    #[must_use]
    pub fn build_pool(&self) -> WorkerPool {
        self.pool_size
            .map_or_else(WorkerPool::new, WorkerPool::with_size)
    }
}

/// Everything the CLI needs to run a load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
}

impl AppConfig {
    /// Reads `path` (or starts from defaults when `None`), applies
    /// environment overrides, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, an
    /// override is malformed, or a value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                log::debug!("Loading config from {}", path.display());
                Self::from_toml(&std::fs::read_to_string(path)?)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] if the document is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Applies overrides looked up through `lookup` (normally the process
    /// environment).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric override does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_WORKER_TIMEOUT_MS) {
            self.pipeline.worker_timeout_ms = parse_override(ENV_WORKER_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_POOL_SIZE) {
            self.pipeline.pool_size = Some(parse_override(ENV_POOL_SIZE, &value)?);
        }
        if let Some(value) = lookup(ENV_API_URL)
            && !value.trim().is_empty()
        {
            self.source.api_url = value.trim().to_string();
        }
        Ok(())
    }

    /// Rejects values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("pipeline.worker_timeout_ms", self.pipeline.worker_timeout_ms == 0),
            ("pipeline.fallback_parse_chunk", self.pipeline.fallback_parse_chunk == 0),
            (
                "pipeline.coordinate_yield_interval",
                self.pipeline.coordinate_yield_interval == 0,
            ),
            (
                "pipeline.progress_channel_capacity",
                self.pipeline.progress_channel_capacity == 0,
            ),
            ("source.page_size", self.source.page_size == 0),
            ("source.request_timeout_secs", self.source.request_timeout_secs == 0),
        ];

        if let Some((name, _)) = checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Invalid {
                message: format!("{name} must be greater than zero"),
            });
        }

        if self.pipeline.pool_size == Some(0) {
            return Err(ConfigError::Invalid {
                message: "pipeline.pool_size must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        message: format!("{key}={value:?} is not a valid number"),
    })
}
