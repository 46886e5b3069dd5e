//! Runtime configuration
//!
//! Loaded from a TOML file (all sections optional) and then overridden by
//! `STRAND_WORKERS` and `STRAND_VERIFY` from the environment.
//!
//! ```toml
//! [scheduler]
//! workers = 4
//!
//! [instrument]
//! allow_blocking = true
//! exclude = ["vendor.*"]
//!
//! [verify]
//! mode = "fail"
//! waivers = ["Util.log"]
//! ```

use crate::defaults::{
    DEFAULT_IDLE_SLEEP_US, DEFAULT_STACK_POOL_SIZE, DEFAULT_STACK_SIZE, ENV_VERIFY, ENV_WORKERS,
};
use crate::instrument::InstrumentOptions;
use crate::verify::{VerifyConfig, VerifyMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override has an unusable value
    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads; 0 means one per CPU
    pub workers: usize,
    /// Sleep of an idle worker, in microseconds
    pub idle_sleep_us: u64,
    /// Initial data slots of a new fiber stack
    pub stack_size: usize,
    /// Finished fiber stacks kept for reuse
    pub stack_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            idle_sleep_us: DEFAULT_IDLE_SLEEP_US,
            stack_size: DEFAULT_STACK_SIZE,
            stack_pool_size: DEFAULT_STACK_POOL_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// Worker count with 0 resolved to the CPU count
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool
    pub scheduler: SchedulerConfig,
    /// Instrumentation pass
    pub instrument: InstrumentOptions,
    /// Suspension-time verification
    pub verify: VerifyConfig,
}

impl RuntimeConfig {
    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Read a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// File (if any) plus process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_WORKERS) {
            self.scheduler.workers = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_WORKERS,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_VERIFY) {
            self.verify.mode = value.parse::<VerifyMode>().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_VERIFY,
                value: value.clone(),
            })?;
        }
        Ok(())
    }
}
