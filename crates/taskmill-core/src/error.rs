//! Error types for the Taskmill pipeline.

use thiserror::Error;

/// A shared error type for the entire Taskmill pipeline.
///
/// This provides typed, structured error variants with automatic conversion
/// from common error types via the `From` trait.
#[derive(Error, Debug)]
pub enum MillError {
    /// Configuration error (invalid thresholds, missing server URL).
    ///
    /// Raised at construction time only; steady-state failures never use
    /// this variant.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization {
        format: String, // "JSON", etc.
        message: String,
    },

    /// HTTP transport error (connection failure or non-success status)
    #[error("HTTP error: {message}")]
    Http {
        status: Option<u16>,
        message: String,
    },

    /// Document store error (bulk/search/delete operations)
    #[error("Store error: {0}")]
    Store(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MillError {
    /// Creates a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a Store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Creates an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Creates an Http error from a response status code
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Check if this is a config error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this is an HTTP transport error
    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http { .. })
    }
}

impl From<serde_json::Error> for MillError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for MillError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("{} (kind: {:?})", err, err.kind()))
    }
}

/// A type alias for `Result<T, MillError>`.
pub type Result<T> = std::result::Result<T, MillError>;
