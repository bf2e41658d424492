//! Error types and the shared error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of failures, orthogonal to transport codes.
///
/// Every error surfaced across a crate boundary maps to exactly one kind.
/// Only [`ErrorKind::Transient`] is advertised as retryable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Coordinate, object, or session id does not exist.
    NotFound,
    /// Malformed request, wrong state, sequence gap, or range outside object.
    Invalid,
    /// State transition not permitted (e.g. chunk after commit).
    Conflict,
    /// The backing store refused the operation.
    PermissionDenied,
    /// Byte caps or session limits exceeded.
    ResourceExhausted,
    /// Transient backend failure; the caller may retry with backoff.
    Transient,
    /// Digest mismatch detected at commit.
    Integrity,
    /// Caller cancelled or a timeout fired.
    Cancelled,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Whether a caller should retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Short stable label used in failure progress snapshots and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Invalid => "invalid",
            Self::Conflict => "conflict",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Transient => "unavailable",
            Self::Integrity => "integrity",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid chunk size: {size} (must be between {min} and {max})")]
    InvalidChunkSize { size: u64, min: u64, max: u64 },

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify this error into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DigestMismatch { .. } => ErrorKind::Integrity,
            _ => ErrorKind::Invalid,
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
