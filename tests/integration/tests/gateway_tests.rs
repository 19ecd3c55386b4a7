//! Gateway integration tests against the fake gateway
//!
//! Run with: `cargo test -p integration-tests --test gateway_tests`

use std::sync::Arc;
use std::time::Duration;

use chat_core::Snowflake;
use chat_gateway::protocol::OpCode;
use chat_gateway::{
    ChannelHandler, GatewayError, GatewayEvent, GatewaySession, LifecycleEvent, NoopHandler,
    SessionStatus, ShardManager, ShardManagerConfig,
};
use integration_tests::{
    fast_identify_limiter, gateway_bot_body, test_gateway_config, wait_until, FakeRest, Script,
    TestGateway,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

const HEARTBEAT: Duration = Duration::from_secs(1);
const PATIENCE: Duration = Duration::from_secs(5);

fn spawn_session(session: &Arc<GatewaySession>, url: String) -> JoinHandle<Result<(), GatewayError>> {
    let runner = Arc::clone(session);
    tokio::spawn(async move { runner.start(&url).await })
}

fn drain(rx: &mut UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn lifecycle(events: &[GatewayEvent]) -> Vec<LifecycleEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            GatewayEvent::Lifecycle { event, .. } => Some(event.clone()),
            GatewayEvent::Dispatch { .. } => None,
        })
        .collect()
}

fn dispatches(events: &[GatewayEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            GatewayEvent::Dispatch { event, .. } => Some(event.clone()),
            GatewayEvent::Lifecycle { .. } => None,
        })
        .collect()
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_identify_ready_and_clean_stop() {
    let gateway = TestGateway::start(Duration::from_millis(100), vec![])
        .await
        .unwrap();
    let (handler, mut rx) = ChannelHandler::new();
    let session = Arc::new(GatewaySession::new(0, 1, test_gateway_config(), Arc::new(handler)));

    let task = spawn_session(&session, gateway.url());
    session.wait_until_ready().await.unwrap();

    assert_eq!(session.status(), SessionStatus::Connected);
    assert_eq!(session.session_id().as_deref(), Some("session-0"));

    // Heartbeats are ACKed, so a round trip gets measured
    assert!(wait_until(PATIENCE, || session.latency().is_some()).await);
    assert!(wait_until(PATIENCE, || session.sequence() == Some(2)).await);

    session.stop().await;
    assert!(task.await.unwrap().is_ok());
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(gateway.connections(), 1);

    let identify = gateway.handshakes()[0].message.as_identify().unwrap();
    assert_eq!(identify.token, "test-token");
    assert_eq!(identify.shard, Some([0, 1]));

    let events = drain(&mut rx);
    assert_eq!(dispatches(&events), vec!["READY", "GUILD_CREATE"]);
    let lifecycle = lifecycle(&events);
    assert_eq!(lifecycle.first(), Some(&LifecycleEvent::Connected));
    assert!(lifecycle.contains(&LifecycleEvent::ShardReady));
}

#[tokio::test]
async fn test_resumes_after_non_fatal_close() {
    let gateway = TestGateway::start(HEARTBEAT, vec![Script::CloseAfterReady(4000)])
        .await
        .unwrap();
    let (handler, mut rx) = ChannelHandler::new();
    let session = Arc::new(GatewaySession::new(0, 1, test_gateway_config(), Arc::new(handler)));

    let task = spawn_session(&session, gateway.url());

    // READY s1, GUILD_CREATE s2, then RESUMED s3, GUILD_CREATE s4
    assert!(wait_until(PATIENCE, || session.sequence() == Some(4)).await);
    assert_eq!(gateway.connections(), 2);

    let handshakes = gateway.handshakes();
    assert_eq!(handshakes.len(), 2);
    assert_eq!(handshakes[0].message.op, OpCode::Identify);
    let resume = handshakes[1].message.as_resume().unwrap();
    assert_eq!(resume.session_id, "session-0");
    assert_eq!(resume.seq, 2);
    assert_eq!(session.session_id().as_deref(), Some("session-0"));

    session.stop().await;
    assert!(task.await.unwrap().is_ok());

    let lifecycle = lifecycle(&drain(&mut rx));
    assert!(lifecycle.contains(&LifecycleEvent::Disconnected { code: Some(4000) }));
    assert!(lifecycle.contains(&LifecycleEvent::Reconnecting { attempt: 1 }));
    assert!(lifecycle.contains(&LifecycleEvent::Resumed));
}

#[tokio::test]
async fn test_session_invalidating_close_identifies_again() {
    let gateway = TestGateway::start(HEARTBEAT, vec![Script::CloseAfterReady(4009)])
        .await
        .unwrap();
    let session = Arc::new(
        GatewaySession::new(0, 1, test_gateway_config(), Arc::new(NoopHandler))
            .with_identify_limiter(fast_identify_limiter(1)),
    );

    let task = spawn_session(&session, gateway.url());

    assert!(wait_until(PATIENCE, || session.session_id().as_deref() == Some("session-1")).await);
    let ops: Vec<OpCode> = gateway.handshakes().iter().map(|f| f.message.op).collect();
    assert_eq!(ops, vec![OpCode::Identify, OpCode::Identify]);
    assert_eq!(gateway.connections(), 2);

    session.stop().await;
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_reconnect_attempts_are_capped() {
    // Reserve a port, then free it so connections are refused
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = test_gateway_config();
    config.max_reconnect_attempts = 2;
    config.reconnect_backoff_min = Duration::from_millis(1);
    config.reconnect_backoff_max = Duration::from_millis(2);
    let (handler, mut rx) = ChannelHandler::new();
    let session = Arc::new(
        GatewaySession::new(0, 1, config, Arc::new(handler))
            .with_identify_limiter(fast_identify_limiter(1)),
    );

    let result = tokio::time::timeout(PATIENCE, session.start(&format!("ws://{addr}")))
        .await
        .unwrap();

    assert!(matches!(
        result,
        Err(GatewayError::ReconnectExhausted { attempts: 2 })
    ));
    assert!(result.unwrap_err().is_fatal());
    assert_eq!(session.status(), SessionStatus::Closed);

    // One backoff between the two failed attempts
    let lifecycle = lifecycle(&drain(&mut rx));
    assert_eq!(
        lifecycle,
        vec![
            LifecycleEvent::Disconnected { code: None },
            LifecycleEvent::Reconnecting { attempt: 2 },
        ]
    );
}

#[tokio::test]
async fn test_fatal_close_is_not_retried() {
    let gateway = TestGateway::start(HEARTBEAT, vec![Script::RejectHandshake(4014)])
        .await
        .unwrap();
    let session = Arc::new(GatewaySession::new(
        0,
        1,
        test_gateway_config(),
        Arc::new(NoopHandler),
    ));

    let result = tokio::time::timeout(PATIENCE, session.start(&gateway.url()))
        .await
        .unwrap();

    let err = result.unwrap_err();
    assert_eq!(err.close_code(), Some(4014));
    assert!(err.is_fatal());
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(gateway.connections(), 1);
    assert!(session.wait_until_ready().await.is_err());
}

#[tokio::test]
async fn test_zombied_connection_reconnects_and_resumes() {
    let gateway = TestGateway::start(Duration::from_millis(200), vec![Script::Silent])
        .await
        .unwrap();
    let (handler, mut rx) = ChannelHandler::new();
    let session = Arc::new(GatewaySession::new(0, 1, test_gateway_config(), Arc::new(handler)));

    let task = spawn_session(&session, gateway.url());

    assert!(wait_until(PATIENCE, || gateway.connections() == 2).await);
    assert!(wait_until(PATIENCE, || gateway.handshakes().len() == 2).await);
    assert_eq!(gateway.handshakes()[1].message.op, OpCode::Resume);

    // The silent connection saw exactly one unanswered heartbeat
    let heartbeats = gateway
        .ops(0)
        .into_iter()
        .filter(|op| *op == OpCode::Heartbeat)
        .count();
    assert_eq!(heartbeats, 1);

    session.stop().await;
    assert!(task.await.unwrap().is_ok());

    let lifecycle = lifecycle(&drain(&mut rx));
    assert!(lifecycle.contains(&LifecycleEvent::Disconnected { code: None }));
    assert!(lifecycle.contains(&LifecycleEvent::Resumed));
}

#[tokio::test]
async fn test_non_resumable_invalid_session_identifies_again() {
    let gateway = TestGateway::start(HEARTBEAT, vec![Script::InvalidateAfterReady(false)])
        .await
        .unwrap();
    let session = Arc::new(
        GatewaySession::new(0, 1, test_gateway_config(), Arc::new(NoopHandler))
            .with_identify_limiter(fast_identify_limiter(1)),
    );

    let task = spawn_session(&session, gateway.url());

    assert!(wait_until(PATIENCE, || session.session_id().as_deref() == Some("session-1")).await);
    let ops: Vec<OpCode> = gateway.handshakes().iter().map(|f| f.message.op).collect();
    assert_eq!(ops, vec![OpCode::Identify, OpCode::Identify]);

    session.stop().await;
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_resumable_invalid_session_resumes() {
    let gateway = TestGateway::start(HEARTBEAT, vec![Script::InvalidateAfterReady(true)])
        .await
        .unwrap();
    let session = Arc::new(GatewaySession::new(
        0,
        1,
        test_gateway_config(),
        Arc::new(NoopHandler),
    ));

    let task = spawn_session(&session, gateway.url());

    assert!(wait_until(PATIENCE, || gateway.handshakes().len() == 2).await);
    assert_eq!(gateway.handshakes()[1].message.op, OpCode::Resume);
    assert_eq!(session.session_id().as_deref(), Some("session-0"));

    session.stop().await;
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_zlib_stream_compression() {
    let gateway = TestGateway::start(HEARTBEAT, vec![]).await.unwrap();
    let (handler, mut rx) = ChannelHandler::new();
    let mut config = test_gateway_config();
    config.compress = true;
    let session = Arc::new(GatewaySession::new(0, 1, config, Arc::new(handler)));

    let task = spawn_session(&session, gateway.url());
    session.wait_until_ready().await.unwrap();
    assert!(wait_until(PATIENCE, || session.sequence() == Some(2)).await);

    assert_eq!(gateway.compressed_connections(), 1);
    assert_eq!(session.session_id().as_deref(), Some("session-0"));

    session.stop().await;
    assert!(task.await.unwrap().is_ok());
    assert_eq!(dispatches(&drain(&mut rx)), vec!["READY", "GUILD_CREATE"]);
}

#[tokio::test]
async fn test_presence_update_reaches_gateway() {
    let gateway = TestGateway::start(HEARTBEAT, vec![]).await.unwrap();
    let session = Arc::new(GatewaySession::new(
        0,
        1,
        test_gateway_config(),
        Arc::new(NoopHandler),
    ));

    let task = spawn_session(&session, gateway.url());
    session.wait_until_ready().await.unwrap();

    let presence = chat_gateway::protocol::PresenceUpdatePayload::new("idle");
    session.update_presence(&presence).await.unwrap();

    assert!(wait_until(PATIENCE, || gateway.ops(0).contains(&OpCode::PresenceUpdate)).await);
    let sent = gateway
        .received()
        .into_iter()
        .find_map(|f| f.message.as_presence_update())
        .unwrap();
    assert_eq!(sent.status, "idle");
    assert!(!sent.afk);

    session.stop().await;
    assert!(task.await.unwrap().is_ok());
}

// ============================================================================
// Shard manager
// ============================================================================

fn shard_manager(gateway: &TestGateway, shards: u32) -> (ShardManager, UnboundedReceiver<GatewayEvent>, Arc<FakeRest>) {
    let rest = FakeRest::gateway(gateway_bot_body(&gateway.url(), shards, 1));
    let mut config = ShardManagerConfig::new(test_gateway_config());
    config.identify_spacing = Duration::from_millis(50);
    let (handler, rx) = ChannelHandler::new();
    let manager = ShardManager::new(Arc::new(rest.client()), config, Arc::new(handler));
    (manager, rx, rest)
}

#[tokio::test]
async fn test_shard_manager_starts_every_shard() {
    let gateway = TestGateway::start(HEARTBEAT, vec![]).await.unwrap();
    let (manager, mut rx, rest) = shard_manager(&gateway, 2);

    tokio::time::timeout(PATIENCE, manager.start())
        .await
        .unwrap()
        .unwrap();

    assert!(manager.is_ready());
    assert_eq!(manager.total_shards(), 2);
    assert_eq!(rest.calls()[0].path, "/api/v10/gateway/bot");

    let mut shards: Vec<[u32; 2]> = gateway
        .handshakes()
        .iter()
        .filter_map(|f| f.message.as_identify())
        .filter_map(|identify| identify.shard)
        .collect();
    shards.sort_unstable();
    assert_eq!(shards, vec![[0, 2], [1, 2]]);

    assert_eq!(manager.shard_for_guild(Snowflake::new(4 << 22)), 0);
    assert_eq!(manager.shard_for_guild(Snowflake::new(5 << 22)), 1);
    assert_eq!(
        manager
            .session_for_guild(Snowflake::new(5 << 22))
            .map(|s| s.shard_id()),
        Some(1)
    );

    let events = drain(&mut rx);
    let lifecycle = lifecycle(&events);
    assert_eq!(
        lifecycle
            .iter()
            .filter(|e| **e == LifecycleEvent::ShardReady)
            .count(),
        2
    );
    assert_eq!(lifecycle.last(), Some(&LifecycleEvent::ClientReady { shards: 2 }));

    manager.stop().await;
    assert!(!manager.is_ready());
    assert!(manager
        .shards()
        .iter()
        .all(|s| s.status() == SessionStatus::Closed));
    assert!(manager.join().await.is_ok());
    assert!(!manager.http().has_token());
}

#[tokio::test]
async fn test_shard_manager_propagates_fatal_close() {
    let gateway = TestGateway::start(HEARTBEAT, vec![Script::RejectHandshake(4014)])
        .await
        .unwrap();
    let (manager, _rx, _rest) = shard_manager(&gateway, 1);

    let err = tokio::time::timeout(PATIENCE, manager.start())
        .await
        .unwrap()
        .unwrap_err();

    assert_eq!(err.close_code(), Some(4014));
    assert!(!manager.is_ready());
    assert_eq!(gateway.connections(), 1);
}
