//! Rate limiter
//!
//! Owns the bucket registry and the global throttle. Every REST attempt goes
//! through [`RateLimiter::acquire`] and reports back with
//! [`RateLimiter::ingest`].
//!
//! Buckets start out anonymous, keyed by the route's local bucket key. Once
//! the server names the bucket (`X-RateLimit-Bucket`) the lock moves under
//! that hash, so unrelated routes sharing a server bucket converge onto a
//! single lock.

use crate::bucket::{BucketGuard, BucketLock, RateLimitHeaders};
use crate::route::Route;
use chat_common::ClientConfig;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Aggregate requests per second across all buckets
    pub global_per_second: u32,
    /// Idle time after which an unused bucket may be evicted
    pub bucket_ttl: Duration,
    /// Registry size that triggers a sweep on acquire
    pub max_buckets: usize,
    /// Upper bound applied to server-provided retry delays (`None` trusts the server)
    pub max_retry_after: Option<Duration>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            global_per_second: 45,
            bucket_ttl: Duration::from_secs(300),
            max_buckets: 10_000,
            max_retry_after: None,
        }
    }
}

impl From<&ClientConfig> for RateLimiterConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            global_per_second: config.global_rate_limit,
            bucket_ttl: Duration::from_secs(config.bucket_ttl_secs),
            ..Self::default()
        }
    }
}

/// Process-wide request throttle
///
/// A token bucket caps the aggregate rate. A global 429 sets a lockout
/// deadline that blocks every route until it passes; overlapping 429s extend
/// the deadline instead of queueing behind each other.
pub struct GlobalThrottle {
    limiter: DefaultDirectRateLimiter,
    lockout: Mutex<Option<Instant>>,
}

impl GlobalThrottle {
    pub fn new(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: governor::RateLimiter::direct(Quota::per_second(rate)),
            lockout: Mutex::new(None),
        }
    }

    /// Wait until no global lockout is active and a token is available
    pub async fn acquire(&self) {
        // a lockout may be extended while we sleep
        while let Some(deadline) = self.deadline() {
            tokio::time::sleep_until(deadline).await;
        }
        self.limiter.until_ready().await;
    }

    /// Block every request for `duration` from now, then return
    ///
    /// The lockout ends at the latest deadline requested so far.
    pub async fn lock_for(&self, duration: Duration) {
        let requested = Instant::now() + duration;
        let deadline = {
            let mut lockout = self.lockout.lock();
            let deadline = lockout.map_or(requested, |current| current.max(requested));
            *lockout = Some(deadline);
            deadline
        };
        tracing::warn!(retry_after = ?duration, "Global rate limit hit, pausing all requests");
        tokio::time::sleep_until(deadline).await;
    }

    /// Active lockout deadline, clearing it once it has passed
    fn deadline(&self) -> Option<Instant> {
        let mut lockout = self.lockout.lock();
        match *lockout {
            Some(deadline) if deadline > Instant::now() => Some(deadline),
            Some(_) => {
                *lockout = None;
                None
            }
            None => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.deadline().is_some()
    }
}

impl std::fmt::Debug for GlobalThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalThrottle")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Bucket registry plus global throttle
pub struct RateLimiter {
    /// Locks keyed by server bucket hash, or by local bucket key until the hash is known
    buckets: DashMap<String, Arc<BucketLock>>,
    /// Local bucket key -> server bucket hash
    route_hashes: DashMap<String, String>,
    global: GlobalThrottle,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            route_hashes: DashMap::new(),
            global: GlobalThrottle::new(config.global_per_second),
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn global(&self) -> &GlobalThrottle {
        &self.global
    }

    /// Lock currently registered for `route`, created on first use
    pub fn bucket_for(&self, route: &Route) -> Arc<BucketLock> {
        let key = route.bucket_key();
        let registry_key = self
            .route_hashes
            .get(&key)
            .map_or(key, |hash| hash.value().clone());

        Arc::clone(
            self.buckets
                .entry(registry_key)
                .or_insert_with(|| Arc::new(BucketLock::new()))
                .value(),
        )
    }

    /// Wait for the route's bucket
    pub async fn acquire(&self, route: &Route) -> BucketGuard {
        if self.buckets.len() > self.config.max_buckets {
            self.sweep();
        }
        let bucket = self.bucket_for(route);
        bucket.acquire().await
    }

    /// Record the rate-limit headers of a response on the held bucket
    ///
    /// The first time a route reports a bucket hash, the held lock is
    /// registered under that hash unless another lock already owns it.
    pub fn ingest(&self, route: &Route, headers: &RateLimitHeaders, guard: &BucketGuard) {
        guard.bucket().update(headers);

        let Some(hash) = &headers.bucket else {
            return;
        };

        let key = route.bucket_key();
        let known = self
            .route_hashes
            .get(&key)
            .is_some_and(|known| known.value() == hash);
        if known {
            return;
        }

        self.route_hashes.insert(key.clone(), hash.clone());
        self.buckets
            .entry(hash.clone())
            .or_insert_with(|| Arc::clone(guard.bucket()));
        self.buckets
            .remove_if(&key, |_, lock| Arc::ptr_eq(lock, guard.bucket()));

        tracing::debug!(route = %route.endpoint(), bucket = %hash, "Discovered rate-limit bucket");
    }

    /// Evict idle buckets nobody holds or waits on
    pub fn sweep(&self) -> usize {
        let ttl = self.config.bucket_ttl;
        let before = self.buckets.len();

        self.buckets.retain(|_, lock| {
            Arc::strong_count(lock) > 1 || lock.is_locked() || lock.idle_for() < ttl
        });
        self.route_hashes
            .retain(|_, hash| self.buckets.contains_key(hash.as_str()));

        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.buckets.len(), "Swept idle rate-limit buckets");
        }
        evicted
    }

    /// Number of registered buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Server bucket hash learned for `route`, if any
    pub fn bucket_hash(&self, route: &Route) -> Option<String> {
        self.route_hashes
            .get(&route.bucket_key())
            .map(|hash| hash.value().clone())
    }

    /// Apply the configured ceiling to a server-provided delay
    pub fn clamp_retry_after(&self, retry_after: Duration) -> Duration {
        match self.config.max_retry_after {
            Some(max) => retry_after.min(max),
            None => retry_after,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.buckets.len())
            .field("known_hashes", &self.route_hashes.len())
            .field("global", &self.global)
            .finish()
    }
}
