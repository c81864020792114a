//! Domain error model.
//!
//! Every layer below the command service returns typed failures. The command
//! service is the only place that decides whether a failure is retried.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Coarse classification used by transport adapters to pick protocol codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    PreconditionFailed,
    AlreadyExists,
    NotFound,
    ConcurrencyConflict,
    Unavailable,
    Internal,
    PermissionDenied,
}

/// Domain-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input. Caller's fault, never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Current state does not allow the operation (e.g. terminated session).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another writer advanced the aggregate. Safe to retry after reloading.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Storage or infrastructure is not reachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The presented refresh token is unknown, rotated, revoked or expired.
    #[error("refresh token invalid")]
    RefreshTokenInvalid,
}

impl DomainError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::PreconditionFailed(_) | Self::RefreshTokenInvalid => {
                ErrorKind::PreconditionFailed
            }
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Internal(_) => ErrorKind::Internal,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
        }
    }

    /// Only optimistic concurrency conflicts are retried by the command service.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}
