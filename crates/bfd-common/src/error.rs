//! Error types shared by the BFD pipeline crates

use thiserror::Error;

/// Result type alias for BFD operations
pub type Result<T> = std::result::Result<T, BfdError>;

/// Main error type for BFD
#[derive(Error, Debug)]
pub enum BfdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Hashing error: {0}")]
    Hashing(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
