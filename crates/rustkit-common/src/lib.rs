//! # RustKit Common
//!
//! Shared error type and logging configuration for the RustKit offline worker
//! crates.
//!
//! ## Features
//!
//! - Workspace-level error type with a stable category string
//! - Logging configuration and setup (pretty, compact, JSON)
//! - Result extension trait for attaching context

use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Workspace-level error for RustKit tools.
///
/// Library crates keep their own error enums; this type is what a tool
/// converts them into at its edge.
#[derive(Error, Debug)]
pub enum RustKitError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache storage errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Worker lifecycle errors (install, activate).
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Logging could not be initialized.
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl RustKitError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a lifecycle error with source.
    pub fn lifecycle_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Get the error category for reports.
    pub fn category(&self) -> &'static str {
        match self {
            RustKitError::Network { .. } => "network",
            RustKitError::Cache { .. } => "cache",
            RustKitError::Lifecycle { .. } => "lifecycle",
            RustKitError::Config { .. } => "config",
            RustKitError::Logging(_) => "logging",
            RustKitError::Io(_) => "io",
            RustKitError::NotFound(_) => "not_found",
        }
    }
}

/// Result type alias for RustKit operations.
pub type Result<T> = std::result::Result<T, RustKitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Wrap the error as a config error with context.
    fn config_context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error as a lifecycle error with context.
    fn lifecycle_context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn config_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| RustKitError::Config {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn lifecycle_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| RustKitError::lifecycle_with_source(message, e))
    }
}
