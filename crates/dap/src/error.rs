//! Error types for the front protocol
//!
//! Simple, flat error hierarchy. Framing errors never reach callers -
//! they are logged and the offending frame is dropped.

use crate::protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DapError>;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport (or the scope the caller sent through) closed
    /// before the operation completed. Cancellation-class: every
    /// outstanding waiter gets this exactly once on teardown.
    #[error("Connection closed")]
    Closed,

    /// The remote side answered a request with `success: false`.
    #[error("Request failed: {}", .0.format)]
    Request(ProtocolError),
}

impl DapError {
    /// The structured payload for errors that carry one.
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            DapError::Request(e) => Some(e),
            _ => None,
        }
    }
}
