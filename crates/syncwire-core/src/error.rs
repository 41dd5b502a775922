//! Error types for syncwire.
//!
//! Transport-level failures (`ConnectionFailed`, `Transport`, `ConnectionClosed`)
//! are broadcast to every outstanding exchange. Exchange-level failures
//! (`Timeout`, `Validation`, `Serialization`, `Protocol`, `Remote`) only fail
//! the call that observed them.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::transport::CloseReason;

/// Main error type for the syncwire library.
#[derive(Debug, Error)]
pub enum SyncwireError {
    // Connection lifecycle errors
    #[error("Failed to connect to {peer} after {attempts} attempts: {last_error}")]
    ConnectionFailed {
        peer: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: CloseReason },

    // Exchange errors
    #[error("Correlation token already registered: {0}")]
    DuplicateToken(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Protocol error: expected {expected}, got {actual}")]
    Protocol { expected: String, actual: String },

    #[error("Peer rejected request: {message}")]
    Remote { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for syncwire operations.
pub type Result<T> = std::result::Result<T, SyncwireError>;

impl From<std::io::Error> for SyncwireError {
    fn from(err: std::io::Error) -> Self {
        SyncwireError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SyncwireError {
    fn from(err: serde_json::Error) -> Self {
        SyncwireError::Serialization {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl SyncwireError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SyncwireError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a transport error from anything displayable.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        SyncwireError::Transport {
            message: message.to_string(),
        }
    }

    /// Reject an outbound frame over [`ProtocolConfig::MAX_FRAME_SIZE`].
    ///
    /// [`ProtocolConfig::MAX_FRAME_SIZE`]: crate::config::ProtocolConfig::MAX_FRAME_SIZE
    pub fn frame_too_large(size: usize) -> Self {
        SyncwireError::Validation {
            field: "frame".to_string(),
            message: format!(
                "frame size {} exceeds maximum {}",
                size,
                crate::config::ProtocolConfig::MAX_FRAME_SIZE
            ),
        }
    }

    /// Whether the caller may retry the operation with a fresh token.
    ///
    /// `ConnectionClosed` and `Transport` are only recoverable by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncwireError::Timeout(_)
                | SyncwireError::ConnectionClosed { .. }
                | SyncwireError::Transport { .. }
        )
    }

    /// Whether the error was caused by the connection going away rather than
    /// by a single exchange.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            SyncwireError::ConnectionFailed { .. }
                | SyncwireError::Transport { .. }
                | SyncwireError::ConnectionClosed { .. }
        )
    }
}
