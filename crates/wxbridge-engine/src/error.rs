use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Upstream protocol error: {0}")]
    Protocol(String),

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unknown message id: {0}")]
    UnknownMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
