//! Error types for EmberDB

use thiserror::Error;

/// Result type alias for EmberDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// EmberDB error types
#[derive(Error, Debug)]
pub enum Error {
    /// Storage is busy, the operation may be retried
    #[error("storage busy")]
    Busy,

    /// Not enough free space in the target page
    #[error("page overflow")]
    Overflow,

    /// Requested item does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid argument supplied by the caller
    #[error("bad argument: {0}")]
    BadArg(String),

    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable failure, the pipeline must be shut down
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Check if the error is transient and may clear on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy)
    }

    /// Check if the error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Check if the error terminates the pipeline
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
