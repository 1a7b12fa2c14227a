//! Error types for Engram

use thiserror::Error;

/// Main error type for Engram operations
#[derive(Error, Debug)]
pub enum EngramError {
    /// Network, timeout-adjacent or busy-store failures worth retrying
    #[error("Transient infrastructure error: {0}")]
    TransientInfra(String),

    /// An inference call exceeded its time bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The inference service refused the input (policy, size, malformed)
    #[error("Content rejected: {0}")]
    ContentRejected(String),

    /// Concurrent modification detected by a check-and-set
    #[error("Consistency conflict: {0}")]
    ConsistencyConflict(String),

    /// A referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unrecoverable failure; the request fails closed
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Storage errors that are not transient (schema, decoding, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied unusable input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngramError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra(_) | Self::Timeout(_))
    }
}

impl From<rusqlite::Error> for EngramError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::TransientInfra(format!("SQLite busy: {err}"))
            }
            Some(ErrorCode::CannotOpen) => Self::Fatal(format!("SQLite unavailable: {err}")),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngramError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for Engram operations
pub type Result<T> = std::result::Result<T, EngramError>;
