//! Error types for session operations.

use thiserror::Error;

use crate::line::LineId;

/// Errors raised by the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Replica error: {0}")]
    Replica(#[from] loro::LoroError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Malformed message: {0}")]
    Message(#[from] serde_json::Error),
    #[error("Malformed payload: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error("Line {0} is still being drawn")]
    LineAlreadyOpen(LineId),
    #[error("Session has been disconnected")]
    Closed,
}

/// Errors raised by a [`Transport`](crate::sync::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid WebSocket URL scheme: {0}")]
    InvalidScheme(String),
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
