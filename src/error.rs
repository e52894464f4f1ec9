//! Error types for droidgram.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request timed out ({0}s limit)")]
    Timeout(u64),

    #[error("Droid error: {0}")]
    Tool(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Telegram error: {0}")]
    Telegram(String),

    #[error("{0}")]
    Other(String),
}

impl From<teloxide::RequestError> for Error {
    fn from(e: teloxide::RequestError) -> Self {
        Error::Telegram(e.to_string())
    }
}
