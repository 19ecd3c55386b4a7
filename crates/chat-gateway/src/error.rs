//! Gateway error types

use crate::inflate::InflateError;
use crate::protocol::{is_fatal_code, CloseCode};
use chat_http::HttpError;
use tokio_tungstenite::tungstenite;

/// Errors surfaced by a gateway session or the shard manager
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The server closed the connection with a code that forbids reconnecting
    #[error("gateway closed the connection: {code} {reason}")]
    Closed { code: u16, reason: String },

    #[error("gave up after {attempts} consecutive failed connection attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),

    #[error(transparent)]
    Inflate(#[from] InflateError),

    #[error("failed to decode gateway payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] HttpError),

    /// Outbound command sent while no connection is live
    #[error("shard is not connected")]
    NotConnected,

    #[error("invalid presence status: {0}")]
    InvalidStatus(String),

    #[error("session is already running")]
    AlreadyRunning,

    /// The session stopped before it became ready
    #[error("session closed before becoming ready")]
    SessionClosed,
}

impl GatewayError {
    /// Close code behind the error, if any
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error ends the shard permanently
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Closed { code, .. } => is_fatal_code(*code),
            Self::ReconnectExhausted { .. } | Self::Http(_) => true,
            _ => false,
        }
    }

    pub(crate) fn closed(code: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = match (reason.is_empty(), CloseCode::from_u16(code)) {
            (true, Some(known)) => known.description().to_string(),
            _ => reason,
        };
        Self::Closed { code, reason }
    }
}

impl From<tungstenite::Error> for GatewayError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
