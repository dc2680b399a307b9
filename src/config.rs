//! Orchestrator configuration.
//!
//! Settings come from an optional TOML file and `CDE_` environment variables,
//! with nested keys separated by `__` (for example
//! `CDE_SCHEDULER__MAX_CONCURRENT=8`). Every field has a default, so an empty
//! source yields [`OrchestratorConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parallel::SchedulerConfig;
use crate::resilience::CircuitBreakerConfig;
use crate::state::StateStoreConfig;
use crate::timeout::TimeoutConfig;

const ENV_PREFIX: &str = "CDE";
const ENV_SEPARATOR: &str = "__";

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    /// Values were read but are out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    /// Overrides `timeout.run_timeout_secs` when set.
    pub run_timeout_secs: Option<u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            run_timeout_secs: None,
        }
    }
}

/// Default circuit breaker settings applied to every breaker a registry
/// creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
            half_open_max_calls: 1,
        }
    }
}

/// State store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub path: PathBuf,
    pub max_backups: usize,
    pub backup_dir: Option<PathBuf>,
}

impl Default for StateSettings {
    fn default() -> Self {
        let defaults = StateStoreConfig::default();
        Self {
            path: defaults.path,
            max_backups: defaults.max_backups,
            backup_dir: defaults.backup_dir,
        }
    }
}

/// Time limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub operation_timeout_secs: u64,
    pub run_timeout_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let defaults = TimeoutConfig::default();
        Self {
            operation_timeout_secs: defaults.operation_timeout.as_secs(),
            run_timeout_secs: defaults.run_timeout.as_secs(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerSettings,
    pub breaker: BreakerSettings,
    pub state: StateSettings,
    pub timeout: TimeoutSettings,
}

impl OrchestratorConfig {
    /// Loads from `path` (when given) and the environment. A missing file
    /// is an error only when a path was given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let loaded: OrchestratorConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parses TOML text without consulting the environment.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let loaded: OrchestratorConfig = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid(
                "breaker.half_open_max_calls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig::with_values(
            Duration::from_secs(self.timeout.operation_timeout_secs),
            Duration::from_secs(self.timeout.run_timeout_secs),
        )
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let run_timeout = self
            .scheduler
            .run_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.timeouts().run_timeout);
        SchedulerConfig::new(self.scheduler.max_concurrent).with_run_timeout(run_timeout)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.breaker.failure_threshold)
            .with_timeout(Duration::from_secs(self.breaker.timeout_secs))
            .with_half_open_max_calls(self.breaker.half_open_max_calls)
    }

    pub fn state_store_config(&self) -> StateStoreConfig {
        let config = StateStoreConfig::new(&self.state.path).with_max_backups(self.state.max_backups);
        match &self.state.backup_dir {
            Some(dir) => config.with_backup_dir(dir),
            None => config,
        }
    }
}
