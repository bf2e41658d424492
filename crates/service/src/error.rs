//! Transfer service error types.

use depot_core::ErrorKind;
use depot_storage::StorageError;
use thiserror::Error;

/// Transfer service error type.
///
/// Every variant maps to exactly one [`ErrorKind`]; adapter errors are
/// classified at this boundary and surfaced with the stable kind.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("integrity failure: expected digest {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Unavailable(_) => ErrorKind::Transient,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Unknown,
        }
    }

    /// Short stable label written into failure progress snapshots.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Integrity { .. } => "digest_mismatch",
            Self::Cancelled(_) => "cancelled",
            other => other.kind().as_str(),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::PermissionDenied => Self::PermissionDenied(message),
            ErrorKind::Transient => Self::Unavailable(message),
            ErrorKind::Invalid => Self::Invalid(message),
            _ => Self::Internal(message),
        }
    }
}

impl From<depot_core::Error> for ServiceError {
    fn from(err: depot_core::Error) -> Self {
        match err {
            depot_core::Error::DigestMismatch { expected, actual } => {
                Self::Integrity { expected, actual }
            }
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// Result type for transfer service operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(ServiceError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(ServiceError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            ServiceError::ResourceExhausted("x".into()).kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            ServiceError::Integrity {
                expected: "a".into(),
                actual: "b".into()
            }
            .kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn storage_errors_classify() {
        let err: ServiceError = StorageError::NotFound("k".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: ServiceError = StorageError::Transient("down".into()).into();
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err: ServiceError = StorageError::InvalidRange("bad".into()).into();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn core_digest_mismatch_becomes_integrity() {
        let err: ServiceError = depot_core::Error::DigestMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.label(), "digest_mismatch");
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(ServiceError::Cancelled("x".into()).label(), "cancelled");
        assert_eq!(ServiceError::Unavailable("x".into()).label(), "unavailable");
        assert_eq!(ServiceError::NotFound("x".into()).label(), "not_found");
    }
}
