//! Core types shared by every resilience pattern

pub mod cancellation;
pub mod config;
pub mod error;
pub mod types;

pub use cancellation::CallContext;
pub use config::{ConfigError, ConfigResult, ResilienceConfig};
pub use error::ResilienceError;
pub use types::{Decision, Outcome, OutcomeKind, Stage};

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;
