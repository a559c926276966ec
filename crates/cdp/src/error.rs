//! Error types for back-protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CdpError>;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// The runtime rejected a command.
    #[error("Protocol error: {code} - {message}")]
    Protocol { code: i32, message: String },

    #[error("Connection closed")]
    Closed,
}
