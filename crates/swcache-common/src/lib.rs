//! # swcache Common
//!
//! Configuration, error types, and logging shared by the swcache crates.
//!
//! ## Features
//!
//! - Unified error type for configuration and timing failures
//! - `SwConfig`, loaded from JSON with defaults for every field
//! - Logging configuration and setup
//! - Timeout helper for async operations

use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod logging;
pub mod timeout;

pub use config::SwConfig;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::{maybe_with_timeout, with_timeout};

/// Unified error type for the ambient layer.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CommonError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CommonError::Config { .. } => "config",
            CommonError::Io(_) => "io",
            CommonError::Timeout(_) => "timeout",
            CommonError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for ambient operations.
pub type Result<T> = std::result::Result<T, CommonError>;
