//! Error types for the portbridge-core library.

use thiserror::Error;

use crate::forward::ForwardError;

/// Result type alias for portbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level library errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Tunnel orchestration error.
    #[error("forward error: {0}")]
    Forward(#[from] ForwardError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
