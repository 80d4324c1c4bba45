//! Common error types for avscan

use thiserror::Error;

/// Common result type for avscan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the avscan crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error (task join failure, unexpected state)
    #[error("Internal error: {0}")]
    Internal(String),
}
