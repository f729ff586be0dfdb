//! Error types for fcgi-mux.

use std::io;

use thiserror::Error;

use crate::protocol::Role;

/// Main error type for all engine operations.
#[derive(Debug, Error)]
pub enum FcgiError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or truncated record. Fatal to the connection.
    #[error("Framing error: {0}")]
    Framing(String),

    /// A buffer wait was aborted because the connection is shutting down.
    #[error("Buffer wait interrupted")]
    Interrupted,

    /// BEGIN_REQUEST named a role with no registered handler.
    #[error("Unknown role: {0}")]
    UnknownRole(u16),

    /// Record carried a protocol version this engine does not speak.
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Supported version.
        expected: u8,
        /// Version found in the record header.
        actual: u8,
    },

    /// A handler returned an error or panicked.
    #[error("Handler fault: {0}")]
    HandlerFault(String),

    /// Two handlers were registered for the same role slot.
    #[error("Role {0:?} already has a registered handler")]
    RoleAlreadyRegistered(Role),

    /// Configuration value out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl FcgiError {
    /// True for errors that only signal shutdown and are not failures.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, FcgiError::Interrupted)
    }

    /// Convert into an `io::Error` for the `std::io` stream adapters.
    ///
    /// Interruption maps to `ConnectionAborted` rather than `Interrupted`,
    /// because `Read::read_to_end` and friends retry the latter forever.
    pub fn into_io(self) -> io::Error {
        match self {
            FcgiError::Io(e) => e,
            FcgiError::Interrupted => io::Error::new(io::ErrorKind::ConnectionAborted, self),
            FcgiError::ConnectionClosed => io::Error::new(io::ErrorKind::BrokenPipe, self),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Result type alias using FcgiError.
pub type Result<T> = std::result::Result<T, FcgiError>;
