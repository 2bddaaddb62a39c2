//! Error types for WorldSync

use thiserror::Error;

use crate::sync::protocol::StatusCode;

/// Main error type for WorldSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// World was not found in the registry
    #[error("World not found: {0}")]
    WorldNotFound(String),

    /// The session's auth identifier is blank or matches no client directory
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// A remote-declared path resolves outside the sandbox root
    #[error("Path escapes sandbox root: {0}")]
    PathEscape(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport (connection or framing) failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer sent a message that is not valid at this point of the exchange
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote side terminated the session with a non-Ok status
    #[error("Session failed ({code:?}): {message}")]
    SessionFailed {
        /// Terminal status code reported by the peer
        code: StatusCode,
        /// Human readable reason
        message: String,
    },

    /// File system notification backend failure
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// World registry could not be loaded
    #[error("World registry error: {0}")]
    Registry(String),

    /// Project marker is missing fields or unreadable
    #[error("Invalid project: {0}")]
    InvalidProject(String),

    /// Authentication challenge was not answered in time
    #[error("Timed out waiting for authentication")]
    AuthTimeout,

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled (shutdown or session teardown)
    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether this error is an expected cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Status code reported to a peer when a session ends with this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::WorldNotFound(_) => StatusCode::NotFound,
            SyncError::Unauthenticated(_) => StatusCode::Unauthenticated,
            SyncError::Cancelled => StatusCode::Cancelled,
            SyncError::SessionFailed { code, .. } => *code,
            _ => StatusCode::Aborted,
        }
    }
}

impl From<postcard::Error> for SyncError {
    fn from(err: postcard::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::Registry(err.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::WorldNotFound("test-world".to_string());
        assert_eq!(format!("{}", err), "World not found: test-world");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_cancelled_is_not_a_failure_status() {
        assert!(SyncError::Cancelled.is_cancelled());
        assert_eq!(SyncError::Cancelled.status_code(), StatusCode::Cancelled);
        assert!(!SyncError::AuthTimeout.is_cancelled());
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            SyncError::WorldNotFound("w".into()).status_code(),
            StatusCode::NotFound
        );
        assert_eq!(
            SyncError::Unauthenticated("blank".into()).status_code(),
            StatusCode::Unauthenticated
        );
        assert_eq!(
            SyncError::Transport("reset".into()).status_code(),
            StatusCode::Aborted
        );
    }
}
