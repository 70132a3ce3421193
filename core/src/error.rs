/// Error types for the realtime sync core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The REST collaborator answered but rejected the request
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The REST collaborator could not be reached
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Outbound queue full ({capacity} pending emissions)")]
    QueueFull { capacity: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("No active conversation")]
    NoActiveConversation,
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            SyncError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            SyncError::Http(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
