//! Client configuration
//!
//! Loads configuration from environment variables (and a `.env` file when
//! present). Component configs in the REST and gateway crates are derived
//! from [`ClientConfig`].

use chat_core::Intents;
use std::env;
use std::str::FromStr;

/// Top-level client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Bot token, sent as `Authorization: Bot <token>`
    pub token: String,
    /// REST base URL without the version suffix
    pub api_base_url: String,
    /// API version used for REST and the gateway URL
    pub api_version: u8,
    /// Intents sent in IDENTIFY
    pub intents: Intents,
    /// Explicit shard count; `None` uses the server recommendation
    pub total_shards: Option<u32>,
    /// Attempt cap for a single REST call
    pub http_max_attempts: u32,
    /// Global request ceiling per second
    pub global_rate_limit: u32,
    /// Idle time after which a rate-limit bucket may be evicted
    pub bucket_ttl_secs: u64,
    /// Member count above which a guild is sent without offline members
    pub large_threshold: u32,
    /// Request zlib-stream compression on the gateway
    pub gateway_compress: bool,
}

// Token stays out of logs
impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("api_version", &self.api_version)
            .field("intents", &self.intents)
            .field("total_shards", &self.total_shards)
            .field("http_max_attempts", &self.http_max_attempts)
            .field("global_rate_limit", &self.global_rate_limit)
            .field("bucket_ttl_secs", &self.bucket_ttl_secs)
            .field("large_threshold", &self.large_threshold)
            .field("gateway_compress", &self.gateway_compress)
            .finish()
    }
}

// Default value functions
fn default_api_base_url() -> String {
    "https://discord.com/api".to_string()
}

fn default_api_version() -> u8 {
    10
}

fn default_http_max_attempts() -> u32 {
    3
}

fn default_global_rate_limit() -> u32 {
    45
}

fn default_bucket_ttl_secs() -> u64 {
    300
}

fn default_large_threshold() -> u32 {
    250
}

fn default_gateway_compress() -> bool {
    true
}

impl ClientConfig {
    /// Configuration with every optional value at its default
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base_url: default_api_base_url(),
            api_version: default_api_version(),
            intents: Intents::DEFAULT,
            total_shards: None,
            http_max_attempts: default_http_max_attempts(),
            global_rate_limit: default_global_rate_limit(),
            bucket_ttl_secs: default_bucket_ttl_secs(),
            large_threshold: default_large_threshold(),
            gateway_compress: default_gateway_compress(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// `BOT_TOKEN` is required; everything else falls back to a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("BOT_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingVar("BOT_TOKEN"))?;

        Ok(Self {
            token,
            api_base_url: lookup("API_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(default_api_base_url),
            api_version: parse_var(&lookup, "API_VERSION")?.unwrap_or_else(default_api_version),
            intents: parse_var(&lookup, "GATEWAY_INTENTS")?.unwrap_or(Intents::DEFAULT),
            total_shards: parse_var(&lookup, "TOTAL_SHARDS")?,
            http_max_attempts: parse_var(&lookup, "HTTP_MAX_ATTEMPTS")?
                .unwrap_or_else(default_http_max_attempts),
            global_rate_limit: parse_var(&lookup, "GLOBAL_RATE_LIMIT")?
                .unwrap_or_else(default_global_rate_limit),
            bucket_ttl_secs: parse_var(&lookup, "BUCKET_TTL_SECS")?
                .unwrap_or_else(default_bucket_ttl_secs),
            large_threshold: parse_var(&lookup, "LARGE_THRESHOLD")?
                .unwrap_or_else(default_large_threshold),
            gateway_compress: parse_var(&lookup, "GATEWAY_COMPRESS")?
                .unwrap_or_else(default_gateway_compress),
        })
    }

    /// Versioned REST root, e.g. `https://discord.com/api/v10`
    #[must_use]
    pub fn api_url(&self) -> String {
        format!("{}/v{}", self.api_base_url, self.api_version)
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key, raw)),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
