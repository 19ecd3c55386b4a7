//! REST error taxonomy

use crate::route::RouteError;
use crate::transport::TransportError;
use serde_json::Value;
use std::time::Duration;

/// Errors raised by the request executor
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Non-retried 4xx (including 401 outside of login)
    #[error("{route}: HTTP {status}: {body}")]
    Http {
        status: u16,
        body: Value,
        route: String,
    },

    #[error("{route}: forbidden: {body}")]
    Forbidden { body: Value, route: String },

    #[error("{route}: not found: {body}")]
    NotFound { body: Value, route: String },

    /// 5xx that was not retried, or still failing after the last attempt
    #[error("{route}: server error {status}: {body}")]
    ServerError {
        status: u16,
        body: Value,
        route: String,
    },

    /// Still rate limited after the last attempt
    #[error("{route}: rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration, route: String },

    #[error("an improper token was passed")]
    LoginError,

    #[error("gateway URL could not be resolved")]
    GatewayNotFound(#[source] Box<HttpError>),

    #[error("invalid route: {0}")]
    Route(#[from] RouteError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
}

impl HttpError {
    /// HTTP status of the response behind the error, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::ServerError { status, .. } => Some(*status),
            Self::Forbidden { .. } => Some(403),
            Self::NotFound { .. } => Some(404),
            Self::RateLimited { .. } => Some(429),
            Self::GatewayNotFound(inner) => inner.status(),
            _ => None,
        }
    }

    /// Response body behind the error, if any
    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::Http { body, .. }
            | Self::Forbidden { body, .. }
            | Self::NotFound { body, .. }
            | Self::ServerError { body, .. } => Some(body),
            _ => None,
        }
    }
}
