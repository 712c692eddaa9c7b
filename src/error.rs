//! Error types for the redo log.

use std::io;
use thiserror::Error;

/// Result type alias for redo log operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for redo log operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from file or socket operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// Log file header is unreadable (bad magic, short read, newer version).
    #[error("Corrupt redo log header: {0}")]
    CorruptHeader(String),

    /// Entry stream corruption detected during replay.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// No reachable leader to forward to.
    #[error("Leader unavailable: {0}")]
    LeaderUnavailable(String),

    /// Malformed HTTP request or response.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Writer is not open.
    #[error("Redo log writer is closed")]
    WriterClosed,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corrupt header error.
    pub fn corrupt_header<S: Into<String>>(msg: S) -> Self {
        Error::CorruptHeader(msg.into())
    }

    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a leader unavailable error.
    pub fn leader_unavailable<S: Into<String>>(msg: S) -> Self {
        Error::LeaderUnavailable(msg.into())
    }

    /// Create an HTTP error.
    pub fn http<S: Into<String>>(msg: S) -> Self {
        Error::Http(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error is recoverable.
    ///
    /// Only a missing leader is; the write falls back to local staging.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::LeaderUnavailable(_))
    }

    /// Check if this error indicates on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptHeader(_) | Error::Corruption(_))
    }
}
