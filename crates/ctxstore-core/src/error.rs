//! Storage errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend's client library is not compiled in, or its service is unreachable.
    #[error("Backend {backend} unavailable: {reason}")]
    CapabilityMissing { backend: &'static str, reason: String },

    #[error("Unsupported connection scheme '{scheme}', supported schemes: {supported}")]
    UnsupportedScheme { scheme: String, supported: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Backend {backend} failed during {operation} for context '{id}': {message}")]
    Backend {
        backend: &'static str,
        operation: &'static str,
        id: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn capability_missing(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::CapabilityMissing {
            backend,
            reason: reason.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn backend(
        backend: &'static str,
        operation: &'static str,
        id: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Backend {
            backend,
            operation,
            id: id.into(),
            message: message.to_string(),
        }
    }

    pub fn serialization(message: impl ToString) -> Self {
        Self::Serialization(message.to_string())
    }
}

/// Convenience type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
