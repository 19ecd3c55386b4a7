//! # chat-http
//!
//! REST side of the client: routes and their rate-limit bucket keys, the
//! bucket registry with its global throttle, and the retrying request
//! executor.
//!
//! ```text
//! HttpClient::request(route)
//!   -> RateLimiter::acquire(route)      bucket lock (FIFO)
//!   -> GlobalThrottle::acquire()        45 req/s, blocked during a global 429
//!   -> HttpTransport::send()
//!   -> RateLimiter::ingest(headers)     learn bucket hash, remaining, reset
//! ```

pub mod bucket;
pub mod client;
pub mod error;
pub mod ratelimit;
pub mod route;
pub mod transport;

pub use bucket::{BucketGuard, BucketLock, BucketState, RateLimitHeaders};
pub use client::{
    gateway_url, AttemptError, GatewayBot, HttpClient, HttpClientConfig, RetryReason,
    SessionStartLimit, DEFAULT_USER_AGENT,
};
pub use error::HttpError;
pub use ratelimit::{GlobalThrottle, RateLimiter, RateLimiterConfig};
pub use route::{Route, RouteError};
pub use transport::{
    FileAttachment, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, RequestBody,
    TransportError,
};

// Re-exported so callers can build routes and responses without a direct reqwest dependency
pub use reqwest::{header, Method, StatusCode};
