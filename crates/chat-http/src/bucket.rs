//! Rate-limit buckets
//!
//! A [`BucketLock`] serializes requests that share a server bucket. Holding a
//! [`BucketGuard`] is the right to have one request in flight on it. The guard
//! can be released at once, or after a delay when the server reports the
//! bucket as exhausted.

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Rate-limit headers of one response
///
/// Absent or malformed headers parse as `None`, never as zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub retry_after: Option<Duration>,
    pub global: bool,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        Self {
            bucket: get(HEADER_BUCKET).map(ToString::to_string),
            limit: get(HEADER_LIMIT).and_then(|v| v.parse().ok()),
            remaining: get(HEADER_REMAINING).and_then(|v| v.parse().ok()),
            reset_after: get(HEADER_RESET_AFTER).and_then(parse_seconds),
            retry_after: get(HEADER_RETRY_AFTER).and_then(parse_seconds),
            global: get(HEADER_GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        }
    }

    /// The response used the last request of the window
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Parse a non-negative, possibly fractional number of seconds
pub fn parse_seconds(raw: &str) -> Option<Duration> {
    raw.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Server-reported state of a bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketState {
    pub bucket_hash: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
}

/// Lock plus state for one bucket
#[derive(Debug)]
pub struct BucketLock {
    gate: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<BucketState>,
    last_used: Mutex<Instant>,
}

impl BucketLock {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(BucketState::default()),
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// Wait for exclusive use of the bucket (FIFO among waiters)
    pub async fn acquire(self: &Arc<Self>) -> BucketGuard {
        self.touch();
        let permit = Arc::clone(&self.gate).lock_owned().await;
        BucketGuard {
            bucket: Arc::clone(self),
            permit: Some(permit),
        }
    }

    /// Whether a request or a deferred release currently holds the bucket
    pub fn is_locked(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub fn state(&self) -> BucketState {
        self.state.lock().clone()
    }

    /// Copy server-reported values into the bucket; absent headers leave the
    /// previous value untouched
    pub fn update(&self, headers: &RateLimitHeaders) {
        let mut state = self.state.lock();
        if let Some(hash) = &headers.bucket {
            state.bucket_hash = Some(hash.clone());
        }
        if headers.limit.is_some() {
            state.limit = headers.limit;
        }
        if headers.remaining.is_some() {
            state.remaining = headers.remaining;
        }
        if headers.reset_after.is_some() {
            state.reset_after = headers.reset_after;
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }
}

impl Default for BucketLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on a bucket; dropping it releases the bucket
#[derive(Debug)]
pub struct BucketGuard {
    bucket: Arc<BucketLock>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl BucketGuard {
    pub fn bucket(&self) -> &Arc<BucketLock> {
        &self.bucket
    }

    /// Release now
    pub fn release(self) {
        drop(self);
    }

    /// Release after `delay` without making the caller wait
    pub fn release_after(mut self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        if let Some(permit) = self.permit.take() {
            let bucket = Arc::clone(&self.bucket);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                bucket.touch();
                drop(permit);
            });
        }
    }
}

impl Drop for BucketGuard {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            self.bucket.touch();
        }
    }
}
