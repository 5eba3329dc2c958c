//! Error types for CairnChain
//!
//! Consensus outcomes are stable numeric codes (see the `*Invalid` and
//! `*Error` enums next to the rules they describe). `ChainError` covers the
//! infrastructure failures around them: storage, I/O, encoding and config.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Dispatcher error: {0}")]
    DispatcherError(String),
    #[error("Node is shutting down")]
    Shutdown,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::CodecError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
