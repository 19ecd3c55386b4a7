//! Test helpers for integration tests
//!
//! Provides a scripted fake gateway (axum WebSocket server), an in-memory
//! REST transport and polling utilities.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chat_common::{try_init_tracing_with_config, TracingConfig};
use chat_gateway::protocol::{GatewayMessage, HelloPayload, OpCode};
use chat_http::{HttpClient, HttpClientConfig, HttpRequest, HttpResponse, HttpTransport, TransportError};
use flate2::{Compress, Compression, FlushCompress};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::fixtures::{ready_payload, TEST_GUILD_ID};

/// Install the test subscriber once; later calls are no-ops
pub fn init_test_tracing() {
    let _ = try_init_tracing_with_config(TracingConfig::development());
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Fake gateway
// ============================================================================

/// What the fake gateway does on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// HELLO, ACK heartbeats, READY/RESUMED after the handshake, one GUILD_CREATE
    Serve,
    /// Like `Serve`, then close with the code
    CloseAfterReady(u16),
    /// Like `Serve`, then send INVALID_SESSION with the given `d`
    InvalidateAfterReady(bool),
    /// Close with the code as soon as IDENTIFY or RESUME arrives
    RejectHandshake(u16),
    /// Like `Serve` but never ACK a heartbeat
    Silent,
}

/// A frame the fake gateway received
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub connection: usize,
    pub message: GatewayMessage,
}

struct GatewayState {
    url: String,
    heartbeat_interval: u64,
    scripts: Mutex<VecDeque<Script>>,
    connections: AtomicUsize,
    compressed: AtomicUsize,
    received: Mutex<Vec<ReceivedFrame>>,
}

/// Fake gateway instance that manages lifecycle
pub struct TestGateway {
    pub addr: SocketAddr,
    state: Arc<GatewayState>,
    _handle: JoinHandle<()>,
}

impl TestGateway {
    /// Start a gateway that plays `scripts` on successive connections, then
    /// `Script::Serve`
    pub async fn start(heartbeat_interval: Duration, scripts: Vec<Script>) -> Result<Self> {
        init_test_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(GatewayState {
            url: format!("ws://{addr}"),
            heartbeat_interval: heartbeat_interval.as_millis() as u64,
            scripts: Mutex::new(scripts.into()),
            connections: AtomicUsize::new(0),
            compressed: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/", get(gateway_handler))
            .with_state(Arc::clone(&state));

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Ok(Self {
            addr,
            state,
            _handle: handle,
        })
    }

    /// Bare `ws://` URL, as `/gateway/bot` would report it
    pub fn url(&self) -> String {
        self.state.url.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Connections that negotiated zlib-stream
    pub fn compressed_connections(&self) -> usize {
        self.state.compressed.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ReceivedFrame> {
        self.state.received.lock().unwrap().clone()
    }

    /// IDENTIFY and RESUME frames in arrival order
    pub fn handshakes(&self) -> Vec<ReceivedFrame> {
        self.received()
            .into_iter()
            .filter(|f| matches!(f.message.op, OpCode::Identify | OpCode::Resume))
            .collect()
    }

    /// Ops received on one connection
    pub fn ops(&self, connection: usize) -> Vec<OpCode> {
        self.received()
            .into_iter()
            .filter(|f| f.connection == connection)
            .map(|f| f.message.op)
            .collect()
    }
}

async fn gateway_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let compress = query.get("compress").is_some_and(|c| c == "zlib-stream");
    ws.on_upgrade(move |socket| handle_socket(state, socket, compress))
}

/// Server side of one fake connection
struct FakeConnection {
    socket: WebSocket,
    encoder: Option<Compress>,
    sequence: u64,
}

impl FakeConnection {
    async fn send(&mut self, message: &GatewayMessage) -> Result<()> {
        let json = message.to_json()?;
        let frame = match self.encoder.as_mut() {
            Some(encoder) => Message::Binary(zlib_sync_flush(encoder, json.as_bytes())?),
            None => Message::Text(json),
        };
        self.socket.send(frame).await?;
        Ok(())
    }

    async fn dispatch(&mut self, event: &str, data: Value) -> Result<()> {
        self.sequence += 1;
        self.send(&GatewayMessage::dispatch(event, self.sequence, data))
            .await
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code,
            reason: "scripted close".into(),
        };
        let _ = self.socket.send(Message::Close(Some(frame))).await;
    }
}

/// Compress one message on the connection's shared context, ending in a sync flush
fn zlib_sync_flush(encoder: &mut Compress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() + 64);
    let start = encoder.total_in();
    loop {
        let consumed = (encoder.total_in() - start) as usize;
        if out.len() == out.capacity() {
            out.reserve(256);
        }
        encoder.compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)?;
        if (encoder.total_in() - start) as usize == input.len() && out.len() < out.capacity() {
            return Ok(out);
        }
    }
}

async fn handle_socket(state: Arc<GatewayState>, socket: WebSocket, compress: bool) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    let script = state
        .scripts
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Script::Serve);
    if compress {
        state.compressed.fetch_add(1, Ordering::SeqCst);
    }

    tracing::info!(connection, ?script, compress, "Fake gateway connection");

    let mut conn = FakeConnection {
        socket,
        encoder: compress.then(|| Compress::new(Compression::default(), true)),
        sequence: 0,
    };

    let hello = GatewayMessage::hello(&HelloPayload::with_interval(state.heartbeat_interval));
    if conn.send(&hello).await.is_err() {
        return;
    }

    while let Some(Ok(frame)) = conn.socket.recv().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(message) = GatewayMessage::from_json(&text) else {
            continue;
        };
        state.received.lock().unwrap().push(ReceivedFrame {
            connection,
            message: message.clone(),
        });

        match message.op {
            OpCode::Heartbeat if script != Script::Silent => {
                if conn.send(&GatewayMessage::heartbeat_ack()).await.is_err() {
                    break;
                }
            }
            OpCode::Identify | OpCode::Resume => {
                if let Script::RejectHandshake(code) = script {
                    conn.close(code).await;
                    return;
                }
                if handshake(&state, &mut conn, connection, &message).await.is_err() {
                    break;
                }
                match script {
                    Script::CloseAfterReady(code) => {
                        conn.close(code).await;
                        return;
                    }
                    Script::InvalidateAfterReady(resumable) => {
                        let _ = conn.send(&GatewayMessage::invalid_session(resumable)).await;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    tracing::debug!(connection, "Fake gateway connection ended");
}

/// Answer IDENTIFY with READY or RESUME with RESUMED, then one GUILD_CREATE
async fn handshake(
    state: &GatewayState,
    conn: &mut FakeConnection,
    connection: usize,
    message: &GatewayMessage,
) -> Result<()> {
    if let Some(identify) = message.as_identify() {
        let shard = identify.shard.unwrap_or([0, 1]);
        let session_id = format!("session-{connection}");
        conn.dispatch("READY", ready_payload(&session_id, &state.url, shard))
            .await?;
    } else if let Some(resume) = message.as_resume() {
        conn.sequence = resume.seq;
        conn.dispatch("RESUMED", Value::Null).await?;
    }
    conn.dispatch("GUILD_CREATE", json!({"id": TEST_GUILD_ID}))
        .await
}

// ============================================================================
// Fake REST transport
// ============================================================================

type Responder = Box<dyn Fn(&HttpRequest, usize) -> HttpResponse + Send + Sync>;

/// A request the fake transport served
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub started: Instant,
    pub finished: Instant,
}

/// In-memory REST transport
///
/// Every request is answered by the responder after `latency`. The
/// transport records timing and the highest number of requests in flight at
/// once.
pub struct FakeRest {
    responder: Responder,
    latency: Duration,
    calls: Mutex<Vec<RecordedCall>>,
    started: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRest {
    /// `responder` gets the request and its zero-based index
    pub fn new<F>(latency: Duration, responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest, usize) -> HttpResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            latency,
            calls: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Transport that serves `/gateway` and `/gateway/bot` for a fake gateway
    pub fn gateway(body: Value) -> Arc<Self> {
        Self::new(Duration::ZERO, move |request, _| {
            if request.url.path().ends_with("/gateway") {
                HttpResponse::json(chat_http::StatusCode::OK, &json!({"url": body["url"]}))
            } else {
                HttpResponse::json(chat_http::StatusCode::OK, &body)
            }
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Requests that reached the transport so far, finished or not
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// REST client using this transport
    pub fn client(self: &Arc<Self>) -> HttpClient {
        let transport: Arc<dyn HttpTransport> = Arc::clone(self) as Arc<dyn HttpTransport>;
        let client = HttpClient::with_transport(HttpClientConfig::default(), transport)
            .unwrap_or_else(|e| panic!("failed to build client: {e}"));
        client.set_token("test-token");
        client
    }
}

#[async_trait]
impl HttpTransport for FakeRest {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let index = self.started.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let response = (self.responder)(&request, index);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(RecordedCall {
            path: request.url.path().to_string(),
            started,
            finished: Instant::now(),
        });
        Ok(response)
    }
}
