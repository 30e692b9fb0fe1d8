//! Error types for the logtap SDK

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LogtapError>;

#[derive(Debug, Error)]
pub enum LogtapError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A user supplied hook failed
    #[error("Hook error: {0}")]
    Hook(String),
}

impl LogtapError {
    pub fn hook(msg: impl Into<String>) -> Self {
        LogtapError::Hook(msg.into())
    }
}
