//! Common error types for Strata.

use thiserror::Error;

/// Top-level error type for Strata operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Path is not a valid absolute node path.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Node store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Remote is not connected.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Remote is known to be offline.
    #[error("Remote is offline")]
    Offline,

    /// Network request failed or timed out.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote rejected our credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Remote answered with an unexpected status code.
    #[error("HTTP response code {0} received")]
    Http(u16),

    /// Synchronizer invariant broken.
    #[error("Sync error: {0}")]
    Sync(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
