//! Front-end error types.

use snag_core::TransportError;
use thiserror::Error;

/// Errors from the console and the remote transports.
#[derive(Debug, Error)]
pub enum UiError {
    /// Socket or terminal I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A client greeting or upgrade request was rejected.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// A client sent a malformed message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A message body was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The `open` argument does not name a front end.
    #[error("unknown front end: {0}")]
    UnknownFrontEnd(String),
}

impl From<UiError> for TransportError {
    fn from(err: UiError) -> Self {
        match err {
            UiError::Io(e) => TransportError::Io(e),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}
