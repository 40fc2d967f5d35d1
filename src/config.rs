//! Executor configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::exec::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BASE_DELAY, DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY, READ_TIMEOUT_SECS,
};
use crate::user_agent::default_user_agent;

/// Errors from loading or validating an [`ExecutorConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its allowed range.
    #[error("Invalid config value for `{field}`: {value}. Expected range: {expected}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// The rejected value, rendered.
        value: String,
        /// The allowed range, rendered.
        expected: &'static str,
    },

    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The HTTP client could not be built from the configuration.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Settings for [`CommandExecutor::new`](crate::exec::CommandExecutor::new).
///
/// Every field has a default, so a JSON file only needs the fields it changes:
///
/// ```json
/// { "max_attempts": 3, "attempt_timeout_ms": 2000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Connect timeout of the reqwest client (1..=3600).
    pub connect_timeout_secs: u64,
    /// Whole-request timeout of the reqwest client (1..=3600).
    pub read_timeout_secs: u64,
    /// Per-attempt budget enforced by the executor; unset means none.
    pub attempt_timeout_ms: Option<u64>,
    /// Attempt ceiling per command, including the first attempt (1..=20).
    pub max_attempts: u32,
    /// Backoff before the first retry (0..=60000).
    pub base_delay_ms: u64,
    /// Cap on the computed backoff; must be >= `base_delay_ms`.
    pub max_delay_ms: u64,
    /// Commands allowed to run their attempt loop at once (1..=100).
    pub concurrency: usize,
    /// User-Agent sent with every request.
    pub user_agent: String,
}

impl Default for ExecutorConfig {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            attempt_timeout_ms: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            concurrency: DEFAULT_CONCURRENCY,
            user_agent: default_user_agent(),
        }
    }
}

impl ExecutorConfig {
    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`] or the first
    /// [`ConfigError::InvalidValue`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "loaded executor config");
        Ok(config)
    }

    /// Validates config values against their allowed ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for the first field out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;

        if self.attempt_timeout_ms == Some(0) {
            return Err(invalid("attempt_timeout_ms", 0, ">= 1 when set"));
        }
        if !(1..=20).contains(&self.max_attempts) {
            return Err(invalid("max_attempts", self.max_attempts, "1..=20"));
        }
        if self.base_delay_ms > 60_000 {
            return Err(invalid("base_delay_ms", self.base_delay_ms, "0..=60000"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid("max_delay_ms", self.max_delay_ms, ">= base_delay_ms"));
        }
        if !(1..=100).contains(&self.concurrency) {
            return Err(invalid("concurrency", self.concurrency, "1..=100"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(invalid("user_agent", "\"\"", "non-empty text"));
        }
        Ok(())
    }

    /// The per-attempt budget, if configured.
    #[must_use]
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        value: value.to_string(),
        expected,
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(invalid(field, value, "1..=3600"));
    }
    Ok(())
}
