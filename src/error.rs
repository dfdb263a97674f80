//! Error types for Pathguard.

use thiserror::Error;

/// Main error type for Pathguard operations.
#[derive(Error, Debug)]
pub enum PathguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed admission request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O errors, mostly from snapshot export
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for Pathguard operations.
pub type Result<T> = std::result::Result<T, PathguardError>;
