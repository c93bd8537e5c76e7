//! Common error types for camsync.

use thiserror::Error;

/// Top-level error type for camsync operations.
///
/// Upload and reachability results are not errors; they are reported as typed
/// outcomes by `camsync-net`. This enum covers everything that can make an
/// operation itself fail.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network setup or transport failure outside an upload attempt.
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The capture collaborator failed to produce an image.
    #[error("Capture error: {0}")]
    Capture(String),

    /// Another process holds the queue directory.
    #[error("Queue locked: {0}")]
    Locked(String),

    /// Durable queue state could not be read back.
    #[error("Store corruption: {0}")]
    StoreCorruption(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
