//! Request executor
//!
//! [`HttpClient::request`] drives one logical REST call through the rate
//! limiter. Each attempt yields `Result<Value, AttemptError>`; the driver loop
//! owns the backoff policy and the attempt cap.

use crate::bucket::RateLimitHeaders;
use crate::error::HttpError;
use crate::ratelimit::{RateLimiter, RateLimiterConfig};
use crate::route::Route;
use crate::transport::{
    HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, RequestBody, TransportError,
};
use chat_common::ClientConfig;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default `User-Agent`, in the form the platform asks bots to send
pub const DEFAULT_USER_AGENT: &str = concat!(
    "DiscordBot (",
    env!("CARGO_PKG_NAME"),
    ", ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// Used when a 429 carries no usable delay at all
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Request executor configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Versioned REST root, e.g. `https://discord.com/api/v10`
    pub api_url: String,
    pub api_version: u8,
    /// Attempts per logical call, including the first
    pub max_attempts: u32,
    pub user_agent: String,
    /// Per-request timeout of the default transport
    pub timeout: Duration,
    pub rate_limit: RateLimiterConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://discord.com/api/v10".to_string(),
            api_version: 10,
            max_attempts: 3,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            rate_limit: RateLimiterConfig::default(),
        }
    }
}

impl From<&ClientConfig> for HttpClientConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            api_url: config.api_url(),
            api_version: config.api_version,
            max_attempts: config.http_max_attempts,
            rate_limit: RateLimiterConfig::from(config),
            ..Self::default()
        }
    }
}

/// `GET /gateway/bot` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    /// Shards allowed to IDENTIFY at the same time
    pub max_concurrency: u32,
}

#[derive(Debug, Deserialize)]
struct GatewayInfo {
    url: String,
}

/// Append the query string the gateway expects to a bare gateway URL
pub fn gateway_url(base: &str, api_version: u8, compress: bool) -> String {
    let base = base.split('?').next().unwrap_or(base).trim_end_matches('/');
    let mut url = format!("{base}/?encoding=json&v={api_version}");
    if compress {
        url.push_str("&compress=zlib-stream");
    }
    url
}

/// Why an attempt asks to be retried
#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    RateLimited { retry_after: Duration, global: bool },
    ServerError { status: u16, body: Value },
    ConnectionReset,
}

/// Outcome of a failed attempt
#[derive(Debug)]
pub enum AttemptError {
    Retry(RetryReason),
    Fatal(HttpError),
}

impl From<HttpError> for AttemptError {
    fn from(err: HttpError) -> Self {
        Self::Fatal(err)
    }
}

/// REST client: rate-limited, retrying request executor
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    ratelimiter: RateLimiter,
    base_url: Url,
    token: RwLock<Option<String>>,
    config: HttpClientConfig,
}

impl HttpClient {
    /// Client over the default `reqwest` transport
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;
        Self::with_transport(config, Arc::new(ReqwestTransport::new(client)))
    }

    /// Client over any transport
    pub fn with_transport(
        config: HttpClientConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, HttpError> {
        let base_url = Url::parse(&config.api_url)?;
        Ok(Self {
            transport,
            ratelimiter: RateLimiter::new(config.rate_limit.clone()),
            base_url,
            token: RwLock::new(None),
            config,
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    pub fn ratelimiter(&self) -> &RateLimiter {
        &self.ratelimiter
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    /// Store the token and validate it with `GET /users/@me`
    pub async fn login(&self, token: impl Into<String>) -> Result<Value, HttpError> {
        self.set_token(token);
        match self.request(&Route::get("/users/@me"), RequestBody::Empty, None).await {
            Ok(user) => {
                tracing::info!("Logged in to REST API");
                Ok(user)
            }
            Err(err) if err.status() == Some(401) => {
                tracing::error!("Login rejected: improper token");
                Err(HttpError::LoginError)
            }
            Err(err) => Err(err),
        }
    }

    /// Forget the token; later requests go out unauthenticated
    pub fn close(&self) {
        self.token.write().take();
        tracing::debug!("REST client closed");
    }

    /// Gateway URL with encoding, version and compression query
    pub async fn get_gateway(&self) -> Result<String, HttpError> {
        let info = self
            .request(&Route::get("/gateway"), RequestBody::Empty, None)
            .await
            .and_then(|value| serde_json::from_value::<GatewayInfo>(value).map_err(HttpError::from))
            .map_err(|e| HttpError::GatewayNotFound(Box::new(e)))?;

        Ok(gateway_url(&info.url, self.config.api_version, true))
    }

    /// Gateway URL plus shard recommendation and identify concurrency
    pub async fn get_gateway_bot(&self) -> Result<GatewayBot, HttpError> {
        let value = self
            .request(&Route::get("/gateway/bot"), RequestBody::Empty, None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Perform one logical REST call
    ///
    /// 429s and 500/502/504 are retried up to `max_attempts`; a connection
    /// reset is retried once. Other failures surface immediately.
    pub async fn request(
        &self,
        route: &Route,
        body: RequestBody,
        reason: Option<&str>,
    ) -> Result<Value, HttpError> {
        let request = self.build_request(route, body, reason)?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut resets = 0u32;
        let mut last_retry = None;

        for attempt in 0..max_attempts {
            match self.attempt(route, &request).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Retry(retry)) => {
                    if retry == RetryReason::ConnectionReset {
                        resets += 1;
                        if resets > 1 {
                            return Err(TransportError::ConnectionReset.into());
                        }
                    }
                    let is_last = attempt + 1 == max_attempts;
                    self.wait_before_retry(route, &retry, attempt, is_last).await;
                    last_retry = Some(retry);
                }
            }
        }

        Err(exhausted(route, last_retry))
    }

    async fn wait_before_retry(&self, route: &Route, retry: &RetryReason, attempt: u32, is_last: bool) {
        match retry {
            RetryReason::RateLimited {
                retry_after,
                global: true,
            } => {
                self.ratelimiter.global().lock_for(*retry_after).await;
            }
            _ if is_last => {}
            RetryReason::RateLimited { retry_after, .. } => {
                tracing::warn!(
                    route = %route.endpoint(),
                    retry_after = ?retry_after,
                    "Rate limited, retrying after bucket reset"
                );
                tokio::time::sleep(*retry_after).await;
            }
            RetryReason::ServerError { status, .. } => {
                let backoff = backoff(attempt);
                tracing::warn!(
                    route = %route.endpoint(),
                    status,
                    backoff = ?backoff,
                    "Server error, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            RetryReason::ConnectionReset => {
                let backoff = backoff(attempt);
                tracing::warn!(route = %route.endpoint(), backoff = ?backoff, "Connection reset, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }

    async fn attempt(&self, route: &Route, request: &HttpRequest) -> Result<Value, AttemptError> {
        let guard = self.ratelimiter.acquire(route).await;
        self.ratelimiter.global().acquire().await;

        let response = match self.transport.send(request.clone()).await {
            Ok(response) => response,
            Err(err) if err.is_connection_reset() => {
                return Err(AttemptError::Retry(RetryReason::ConnectionReset));
            }
            Err(err) => return Err(HttpError::from(err).into()),
        };

        let headers = RateLimitHeaders::from_headers(&response.headers);
        self.ratelimiter.ingest(route, &headers, &guard);
        let status = response.status;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = decode_lenient(&response);
            let (retry_after, global) = self.parse_429(&body, &headers);
            if global {
                guard.release();
            } else {
                guard.release_after(retry_after);
            }
            return Err(AttemptError::Retry(RetryReason::RateLimited {
                retry_after,
                global,
            }));
        }

        match headers.reset_after.filter(|_| headers.is_exhausted()) {
            Some(reset_after) => {
                tracing::debug!(
                    route = %route.endpoint(),
                    reset_after = ?reset_after,
                    "Bucket exhausted, holding until reset"
                );
                guard.release_after(reset_after);
            }
            None => guard.release(),
        }

        if status.is_success() {
            tracing::debug!(route = %route.endpoint(), status = status.as_u16(), "Request completed");
            return decode_success(&response).map_err(AttemptError::from);
        }

        let body = decode_lenient(&response);
        let endpoint = route.endpoint();
        let err = match status.as_u16() {
            500 | 502 | 504 => {
                return Err(AttemptError::Retry(RetryReason::ServerError {
                    status: status.as_u16(),
                    body,
                }));
            }
            403 => HttpError::Forbidden {
                body,
                route: endpoint,
            },
            404 => HttpError::NotFound {
                body,
                route: endpoint,
            },
            code if code >= 500 => HttpError::ServerError {
                status: code,
                body,
                route: endpoint,
            },
            code => HttpError::Http {
                status: code,
                body,
                route: endpoint,
            },
        };

        tracing::error!(route = %route.endpoint(), status = status.as_u16(), "Request failed");
        Err(err.into())
    }

    /// Delay and scope of a 429: JSON body first, then headers
    fn parse_429(&self, body: &Value, headers: &RateLimitHeaders) -> (Duration, bool) {
        let from_body = body
            .get("retry_after")
            .and_then(Value::as_f64)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        let retry_after = from_body
            .or(headers.retry_after)
            .or(headers.reset_after)
            .unwrap_or(FALLBACK_RETRY_AFTER);
        let global = headers.global
            || body
                .get("global")
                .and_then(Value::as_bool)
                .unwrap_or(false);

        (self.ratelimiter.clamp_retry_after(retry_after), global)
    }

    fn build_request(
        &self,
        route: &Route,
        body: RequestBody,
        reason: Option<&str>,
    ) -> Result<HttpRequest, HttpError> {
        let url = route.url(&self.base_url)?;

        let mut headers = HeaderMap::new();
        if let Ok(agent) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert(USER_AGENT, agent);
        }
        if let Some(token) = self.token.read().as_deref() {
            let mut value = HeaderValue::from_str(&format!("Bot {token}"))
                .map_err(|_| HttpError::LoginError)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(reason) = reason {
            if let Ok(value) = HeaderValue::from_str(&encode_reason(reason)) {
                headers.insert(AUDIT_LOG_REASON, value);
            }
        }

        Ok(HttpRequest {
            method: route.method().clone(),
            url,
            headers,
            body,
        })
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.has_token())
            .field("ratelimiter", &self.ratelimiter)
            .finish()
    }
}

/// `1 + attempt * 2` seconds
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 + u64::from(attempt) * 2)
}

fn exhausted(route: &Route, last_retry: Option<RetryReason>) -> HttpError {
    let endpoint = route.endpoint();
    tracing::error!(route = %endpoint, "Request retries exhausted");
    match last_retry {
        Some(RetryReason::RateLimited { retry_after, .. }) => HttpError::RateLimited {
            retry_after,
            route: endpoint,
        },
        Some(RetryReason::ServerError { status, body }) => HttpError::ServerError {
            status,
            body,
            route: endpoint,
        },
        Some(RetryReason::ConnectionReset) | None => TransportError::ConnectionReset.into(),
    }
}

/// Percent-encode an audit log reason
///
/// Unreserved characters, `/` and spaces are left as they are.
fn encode_reason(reason: &str) -> String {
    url::form_urlencoded::byte_serialize(reason.as_bytes())
        .collect::<String>()
        .replace('+', " ")
        .replace("%2F", "/")
        .replace("%7E", "~")
        .replace('*', "%2A")
}

fn decode_success(response: &HttpResponse) -> Result<Value, HttpError> {
    if response.body.is_empty() {
        return Ok(Value::Null);
    }
    if response.is_json() {
        return Ok(serde_json::from_slice(&response.body)?);
    }
    Ok(Value::String(String::from_utf8_lossy(&response.body).into_owned()))
}

fn decode_lenient(response: &HttpResponse) -> Value {
    if response.body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&response.body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&response.body).into_owned()))
}
