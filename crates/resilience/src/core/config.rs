//! Configuration errors and the trait every pattern config implements

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another value
    #[error("invalid configuration: {message}")]
    Validation {
        /// What is wrong
        message: String,
    },

    /// The document is not valid JSON or does not match the schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration file could not be read
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        /// File that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Prefix a validation message with the policy it belongs to
    #[must_use]
    pub fn in_policy(self, policy: &str) -> Self {
        match self {
            Self::Validation { message } => Self::Validation {
                message: format!("policy '{policy}': {message}"),
            },
            other => other,
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Base configuration trait for resilience patterns
pub trait ResilienceConfig: Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone {
    /// Check ranges and cross-field constraints
    fn validate(&self) -> ConfigResult<()>;

    /// Get default configuration
    fn default_config() -> Self
    where
        Self: Sized;

    /// Convert to a JSON value
    fn to_value(&self) -> ConfigResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Create from a JSON value and validate it
    fn from_value(value: serde_json::Value) -> ConfigResult<Self>
    where
        Self: Sized,
    {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn ensure(condition: bool, message: &str) -> ConfigResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::validation(message))
    }
}

pub(crate) fn ensure_ratio(value: f64, field: &str) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::validation(format!(
            "{field} must be in (0.0, 1.0], got {value}"
        )))
    }
}
