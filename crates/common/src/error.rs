//! Common error types for the liveness crates.

use std::fmt;

/// A specialized Result type for liveness operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for liveness operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Unknown machine: {0}")]
    UnknownMachine(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new record store error.
    pub fn store(msg: impl fmt::Display) -> Self {
        Error::Store(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
