//! REST rate-limit integration tests
//!
//! Run with: `cargo test -p integration-tests --test ratelimit_tests`
//!
//! Time is paused, so server-provided delays elapse instantly while the
//! recorded timestamps still reflect them.

use std::time::Duration;

use chat_http::{RequestBody, Route};
use futures::future::join_all;
use integration_tests::{init_test_tracing, ok_with_bucket, too_many_requests, FakeRest};
use tokio::time::Instant;

fn messages(channel: u64) -> Route {
    Route::post("/channels/{channel_id}/messages").param("channel_id", channel)
}

// ============================================================================
// Bucket sharing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_routes_sharing_bucket_hash_are_serialized() {
    init_test_tracing();
    let rest = FakeRest::new(Duration::from_millis(50), |_, _| {
        ok_with_bucket("shared-hash", 4, 1.0)
    });
    let client = rest.client();

    // Discovery: each route reports the same server bucket
    client
        .request(&messages(1), RequestBody::Empty, None)
        .await
        .unwrap();
    client
        .request(&messages(2), RequestBody::Empty, None)
        .await
        .unwrap();

    let limiter = client.ratelimiter();
    assert_eq!(limiter.bucket_hash(&messages(1)).as_deref(), Some("shared-hash"));
    assert_eq!(limiter.bucket_hash(&messages(2)).as_deref(), Some("shared-hash"));

    let routes: Vec<Route> = (0..6).map(|i| messages(1 + i % 2)).collect();
    let results = join_all(
        routes
            .iter()
            .map(|route| client.request(route, RequestBody::Empty, None)),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(rest.calls().len(), 8);
    assert_eq!(rest.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_buckets_run_concurrently() {
    init_test_tracing();
    let rest = FakeRest::new(Duration::from_millis(50), |request, _| {
        let hash = format!("hash-{}", request.url.path());
        ok_with_bucket(&hash, 4, 1.0)
    });
    let client = rest.client();

    let routes: Vec<Route> = (1..=4).map(messages).collect();
    let results = join_all(
        routes
            .iter()
            .map(|route| client.request(route, RequestBody::Empty, None)),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(rest.max_in_flight(), 4);
}

// ============================================================================
// Server-provided delays
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_exhausted_bucket_waits_for_reset() {
    init_test_tracing();
    let rest = FakeRest::new(Duration::ZERO, |_, index| {
        let remaining = if index == 0 { 0 } else { 4 };
        ok_with_bucket("exhausting", remaining, 3.0)
    });
    let client = rest.client();

    client
        .request(&messages(1), RequestBody::Empty, None)
        .await
        .unwrap();
    client
        .request(&messages(1), RequestBody::Empty, None)
        .await
        .unwrap();

    let calls = rest.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].started.duration_since(calls[0].started) >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_global_429_pauses_every_bucket() {
    init_test_tracing();
    let rest = FakeRest::new(Duration::ZERO, |_, index| {
        if index == 0 {
            too_many_requests(5.0, true)
        } else {
            ok_with_bucket("unrelated", 4, 1.0)
        }
    });
    let client = rest.client();
    let start = Instant::now();

    let route = messages(1);
    let limited = client.request(&route, RequestBody::Empty, None);
    let other = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.request(&messages(2), RequestBody::Empty, None).await
    };
    let (limited, other) = tokio::join!(limited, other);

    assert!(limited.is_ok());
    assert!(other.is_ok());

    let calls = rest.calls();
    assert_eq!(calls.len(), 3);
    let other_call = calls
        .iter()
        .find(|call| call.path.ends_with("/channels/2/messages"))
        .unwrap();
    assert!(other_call.started.duration_since(start) >= Duration::from_secs(5));
    assert!(!client.ratelimiter().global().is_locked());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_global_429s_share_one_lockout() {
    init_test_tracing();
    let rest = FakeRest::new(Duration::ZERO, |_, index| {
        if index < 3 {
            too_many_requests(5.0, true)
        } else {
            ok_with_bucket("after-lockout", 4, 1.0)
        }
    });
    let client = rest.client();
    let start = Instant::now();

    let routes: Vec<Route> = (1..=3).map(messages).collect();
    let results = join_all(
        routes
            .iter()
            .map(|route| client.request(route, RequestBody::Empty, None)),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    let calls = rest.calls();
    assert_eq!(calls.len(), 6);
    for retry in &calls[3..] {
        let waited = retry.started.duration_since(start);
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(6));
    }
}

#[tokio::test(start_paused = true)]
async fn test_local_429_only_delays_its_bucket() {
    init_test_tracing();
    // The channel 1 request is polled first, so it is the first to arrive
    let rest = FakeRest::new(Duration::ZERO, |_, index| {
        if index == 0 {
            too_many_requests(2.0, false)
        } else {
            ok_with_bucket("fine", 4, 1.0)
        }
    });
    let client = rest.client();
    let start = Instant::now();

    let route = messages(1);
    let (limited, other) = tokio::join!(
        client.request(&route, RequestBody::Empty, None),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.request(&messages(2), RequestBody::Empty, None).await
        }
    );

    assert!(limited.is_ok());
    assert!(other.is_ok());

    let calls = rest.calls();
    let channel_one: Vec<_> = calls
        .iter()
        .filter(|call| call.path.ends_with("/channels/1/messages"))
        .collect();
    assert_eq!(channel_one.len(), 2);
    assert!(channel_one[1].started.duration_since(start) >= Duration::from_secs(2));

    let other_call = calls
        .iter()
        .find(|call| call.path.ends_with("/channels/2/messages"))
        .unwrap();
    assert!(other_call.started.duration_since(start) < Duration::from_secs(1));
}
