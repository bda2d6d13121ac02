//! Error taxonomy for the protocol core.
//!
//! Every component (resolver, store adapters, lock manager, property engine)
//! reports failures through [`DavError`]. The dispatcher maps each variant to
//! a default HTTP status via [`DavError::status`]; handlers override that
//! mapping where the protocol assigns a method-specific status.

use http::StatusCode;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while handling a WebDAV request.
#[derive(Debug, Error)]
pub enum DavError {
    /// The request URI does not name a resource inside the served root.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The resource exists and the operation refuses to replace it.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The operation conflicts with the state of the store (missing parent,
    /// non-empty collection, etc).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The resource is locked and the request did not submit a covering token.
    #[error("Resource is locked: {0}")]
    Locked(String),

    /// The submitted lock token does not name an active lock.
    #[error("Invalid lock token: {0}")]
    InvalidToken(String),

    /// The lock named by the token has expired.
    #[error("Lock expired: {0}")]
    LockExpired(String),

    /// A conflicting lock prevents granting the requested lock.
    #[error("Conflicting lock on {0}")]
    LockConflict(String),

    /// A conditional header did not match the resource state.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The operation is not permitted on this resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The backing store failed.
    #[error("I/O failure on {path}: {source}")]
    IoFailure {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Malformed header or request body.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The method is not supported on this resource or by this server.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// A request body was supplied where none is understood.
    #[error("Unsupported media type")]
    UnsupportedMediaType,

    /// The destination lives on another server.
    #[error("Destination is on another server: {0}")]
    BadGateway(String),

    /// The requested byte range lies outside the resource.
    #[error("Range not satisfiable (length {0})")]
    RangeNotSatisfiable(u64),
}

impl DavError {
    /// Wrap an I/O error with the resource it happened on.
    pub fn io(path: impl ToString, source: io::Error) -> Self {
        DavError::IoFailure {
            path: path.to_string(),
            source,
        }
    }

    /// Classify an I/O error, keeping the taxonomy-specific kinds.
    pub fn from_io(path: impl ToString, source: io::Error) -> Self {
        let path = path.to_string();
        match source.kind() {
            io::ErrorKind::NotFound => DavError::NotFound(path),
            io::ErrorKind::AlreadyExists => DavError::AlreadyExists(path),
            io::ErrorKind::PermissionDenied => DavError::Forbidden(path),
            io::ErrorKind::DirectoryNotEmpty => DavError::Conflict(path),
            _ => DavError::IoFailure { path, source },
        }
    }

    /// Default HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            DavError::InvalidPath(_) | DavError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DavError::NotFound(_) => StatusCode::NOT_FOUND,
            DavError::AlreadyExists(_) | DavError::MethodNotAllowed(_) => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            DavError::Conflict(_) | DavError::InvalidToken(_) => StatusCode::CONFLICT,
            DavError::Locked(_) | DavError::LockConflict(_) => StatusCode::LOCKED,
            DavError::LockExpired(_) | DavError::PreconditionFailed(_) => {
                StatusCode::PRECONDITION_FAILED
            }
            DavError::Forbidden(_) => StatusCode::FORBIDDEN,
            DavError::IoFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            DavError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }

    /// Whether the error describes a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DavError::NotFound(_))
    }
}

/// Result type for core operations.
pub type DavResult<T> = Result<T, DavError>;

/// Fatal configuration errors, raised before any request is served.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The store root cannot be opened.
    #[error("Unreadable root {path}: {source}")]
    UnreadableRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The store root exists but is not a directory.
    #[error("Root is not a directory: {0}")]
    RootNotDirectory(PathBuf),

    /// The mount prefix is not a valid absolute path.
    #[error("Invalid mount prefix {prefix:?}: {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    /// Lock timeouts are inconsistent.
    #[error("Invalid lock timeouts: default {default:?} exceeds maximum {max:?}")]
    LockTimeouts {
        default: std::time::Duration,
        max: std::time::Duration,
    },

    /// The property database cannot be loaded.
    #[error("Property database {path}: {reason}")]
    PropertyDb { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_mapping() {
        assert_eq!(
            DavError::InvalidPath("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DavError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(DavError::Locked("x".into()).status(), StatusCode::LOCKED);
        assert_eq!(
            DavError::LockConflict("x".into()).status(),
            StatusCode::LOCKED
        );
        assert_eq!(
            DavError::PreconditionFailed("x".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            DavError::io("/f", io::Error::other("disk")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_io_error_classification() {
        let e = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert!(DavError::from_io("/a", e).is_not_found());

        let e = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(DavError::from_io("/a", e), DavError::Forbidden(_)));

        let e = io::Error::new(io::ErrorKind::AlreadyExists, "exists");
        assert!(matches!(
            DavError::from_io("/a", e),
            DavError::AlreadyExists(_)
        ));

        let e = io::Error::other("boom");
        assert!(matches!(
            DavError::from_io("/a", e),
            DavError::IoFailure { .. }
        ));
    }
}
