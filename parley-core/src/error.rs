//! Error types for parley

use thiserror::Error;
use uuid::Uuid;

/// The main error type for parley operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The session store could not be reached or written.
    ///
    /// Recoverable: in-memory state stays authoritative until the next
    /// successful write.
    #[error("Storage unavailable: {0}")]
    Storage(String),

    /// Session management errors
    #[error("Session error: {0}")]
    Session(String),

    /// A turn is already drafting or streaming on this session
    #[error("A turn is already in progress for session {0}")]
    TurnInProgress(Uuid),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),
}

/// A specialized Result type for parley operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether the caller may retry the operation later without losing data
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::TurnInProgress(_))
    }
}
