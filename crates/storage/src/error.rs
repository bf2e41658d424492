//! Storage error types.

use depot_core::ErrorKind;
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("backend temporarily unavailable: {0}")]
    Transient(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Classify into the shared error taxonomy. Every adapter failure
    /// surfaces as one of the stable kinds; only [`ErrorKind::Transient`]
    /// is retryable.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Transient(_) => ErrorKind::Transient,
            Self::InvalidKey(_) | Self::InvalidRange(_) | Self::Unsupported(_) => {
                ErrorKind::Invalid
            }
            Self::Config(_) => ErrorKind::Invalid,
            Self::Io(_) | Self::Backend(_) => ErrorKind::Unknown,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
