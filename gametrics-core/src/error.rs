//! Error types for gametrics-core

use thiserror::Error;

/// Main error type for the gametrics-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Batch delivery error
    #[error("delivery error: {0}")]
    Delivery(String),
}

/// Result type alias for gametrics-core
pub type Result<T> = std::result::Result<T, Error>;
