//! Error types for federation.
//!
//! Three layers: [`StatusError`] for non-2xx responses from remote servers,
//! [`DomainError`] for typed failures reported by the persistence layer, and
//! [`FederationError`] which everything in this crate returns.

use apkernel_common::AppError;
use thiserror::Error;

use crate::lock::LockError;
use crate::signature::SignatureError;

/// Result alias used throughout the crate.
pub type FederationResult<T> = Result<T, FederationError>;

/// Result alias for domain capability calls.
pub type DomainResult<T> = Result<T, DomainError>;

/// A remote server answered with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {message}")]
pub struct StatusError {
    /// HTTP status code.
    pub code: u16,
    /// Status text or a short description.
    pub message: String,
}

impl StatusError {
    /// Create a status error.
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 4xx responses.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// Server errors and 429 may succeed later; other client errors never will.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !self.is_client_error() || self.code == 429
    }
}

/// Typed failures of domain operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("already reacted")]
    AlreadyReacted,

    #[error("not reacted")]
    NotReacted,

    #[error("not blocking")]
    NotBlocking,

    #[error("not following")]
    NotFollowing,

    #[error("no such follow request")]
    NoSuchFollowRequest,

    #[error("blocked by the target user")]
    Blocked,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("user is suspended")]
    Suspended,

    #[error("prohibited content")]
    ProhibitedContent,

    #[error("store error: {0}")]
    Store(String),
}

/// Error type for federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("remote returned {0}")]
    Status(#[from] StatusError),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("too many redirects: {0}")]
    TooManyRedirects(String),

    #[error("hit recursion limit")]
    RecursionLimit,

    #[error("cannot resolve already resolved one: {0}")]
    AlreadyResolved(String),

    #[error("host is blocked: {0}")]
    BlockedHost(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FederationError {
    /// Whether a job that failed with this error should be attempted again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Status(e) => e.is_retryable(),
            Self::Fetch(_) | Self::Lock(_) | Self::Queue(_) | Self::Internal(_) => true,
            Self::Domain(DomainError::Store(_)) => true,
            Self::Domain(_)
            | Self::InvalidObject(_)
            | Self::TooManyRedirects(_)
            | Self::RecursionLimit
            | Self::AlreadyResolved(_)
            | Self::BlockedHost(_)
            | Self::Validation(_)
            | Self::Signature(_) => false,
        }
    }

    /// The status error, if the failure came from a remote response.
    #[must_use]
    pub const fn as_status(&self) -> Option<&StatusError> {
        match self {
            Self::Status(e) => Some(e),
            _ => None,
        }
    }

    /// A remote 4xx that retrying will not fix.
    #[must_use]
    pub const fn is_unrecoverable_client_error(&self) -> bool {
        match self {
            Self::Status(e) => !e.is_retryable(),
            _ => false,
        }
    }
}

impl From<FederationError> for AppError {
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::Validation(msg) | FederationError::InvalidObject(msg) => {
                Self::BadRequest(msg)
            }
            FederationError::Signature(e) => Self::Unauthorized(e.to_string()),
            FederationError::Queue(msg) => Self::Queue(msg),
            other => Self::Federation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_retryability() {
        assert!(!StatusError::new(404, "Not Found").is_retryable());
        assert!(!StatusError::new(410, "Gone").is_retryable());
        assert!(StatusError::new(429, "Too Many Requests").is_retryable());
        assert!(StatusError::new(503, "Service Unavailable").is_retryable());
        assert!(StatusError::new(301, "Moved").is_retryable());
    }

    #[test]
    fn test_federation_error_retryability() {
        assert!(FederationError::Fetch("timeout".into()).is_retryable());
        assert!(FederationError::Domain(DomainError::Store("down".into())).is_retryable());
        assert!(!FederationError::Domain(DomainError::AlreadyReacted).is_retryable());
        assert!(!FederationError::Validation("spoofed".into()).is_retryable());
        assert!(FederationError::from(StatusError::new(404, "x")).is_unrecoverable_client_error());
        assert!(!FederationError::from(StatusError::new(500, "x")).is_unrecoverable_client_error());
    }
}
