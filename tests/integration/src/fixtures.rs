//! Test fixtures and data generators
//!
//! Reusable payloads, configs and responses for integration tests.

use chat_gateway::{GatewayConfig, IdentifyLimiter};
use chat_http::{HttpResponse, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Guild id used in fake dispatches
pub const TEST_GUILD_ID: &str = "81384788765712384";

/// Gateway config tuned for fast tests: no compression, short backoff
pub fn test_gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::new("test-token", chat_core::Intents::DEFAULT);
    config.compress = false;
    config.reconnect_backoff_min = Duration::from_millis(10);
    config.reconnect_backoff_max = Duration::from_millis(20);
    config.max_reconnect_attempts = 3;
    config.close_grace_period = Duration::from_secs(1);
    config
}

/// Identify limiter with a short spacing
pub fn fast_identify_limiter(max_concurrency: u32) -> Arc<IdentifyLimiter> {
    Arc::new(IdentifyLimiter::with_spacing(
        max_concurrency,
        Duration::from_millis(50),
    ))
}

/// READY payload as the fake gateway sends it
pub fn ready_payload(session_id: &str, resume_gateway_url: &str, shard: [u32; 2]) -> Value {
    json!({
        "v": 10,
        "user": {"id": "1", "username": "test-bot"},
        "guilds": [{"id": TEST_GUILD_ID, "unavailable": true}],
        "session_id": session_id,
        "resume_gateway_url": resume_gateway_url,
        "shard": shard,
    })
}

/// `GET /gateway/bot` body
pub fn gateway_bot_body(url: &str, shards: u32, max_concurrency: u32) -> Value {
    json!({
        "url": url,
        "shards": shards,
        "session_start_limit": {
            "total": 1000,
            "remaining": 999,
            "reset_after": 14_400_000,
            "max_concurrency": max_concurrency,
        }
    })
}

/// 200 carrying a bucket hash and remaining count
pub fn ok_with_bucket(bucket: &str, remaining: u32, reset_after: f64) -> HttpResponse {
    HttpResponse::json(StatusCode::OK, &json!({"id": "1"}))
        .header("x-ratelimit-bucket", bucket)
        .header("x-ratelimit-limit", "5")
        .header("x-ratelimit-remaining", remaining.to_string())
        .header("x-ratelimit-reset-after", reset_after.to_string())
}

/// 429 response as the API sends it
pub fn too_many_requests(retry_after: f64, global: bool) -> HttpResponse {
    let mut response = HttpResponse::json(
        StatusCode::TOO_MANY_REQUESTS,
        &json!({
            "message": "You are being rate limited.",
            "retry_after": retry_after,
            "global": global,
        }),
    )
    .header("retry-after", retry_after.ceil().to_string());
    if global {
        response = response.header("x-ratelimit-global", "true");
    }
    response
}
