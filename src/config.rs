//! Runtime Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `ICHOR_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ICHOR_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `ICHOR_STEP_BUDGET` | Interpreter steps per scheduler turn | 2048 |
//! | `ICHOR_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `ICHOR_LOG_FORMAT` | Log output format (plain/json) | plain |

use std::env;

use thiserror::Error;

use crate::log::{LogFormat, LogLevel};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads. Default: number of available CPUs.
    pub num_workers: usize,

    /// Interpreter steps a fiber may take before yielding its turn.
    /// Default: 2048.
    pub step_budget: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            step_budget: 2048,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load configuration from the environment, falling back to defaults
    /// for unset or unparsable variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("ICHOR_NUM_WORKERS") {
            config.scheduler.num_workers = val;
        }
        if let Some(val) = parse_env_usize("ICHOR_STEP_BUDGET") {
            config.scheduler.step_budget = val;
        }
        if let Some(val) = env::var("ICHOR_LOG_LEVEL").ok().and_then(|s| LogLevel::parse(&s)) {
            config.log_level = val;
        }
        if let Some(val) = env::var("ICHOR_LOG_FORMAT").ok().and_then(|s| LogFormat::parse(&s)) {
            config.log_format = val;
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers",
                message: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.step_budget == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.step_budget",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    pub fn step_budget(mut self, n: usize) -> Self {
        self.config.scheduler.step_budget = n;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log_format = format;
        self
    }

    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
