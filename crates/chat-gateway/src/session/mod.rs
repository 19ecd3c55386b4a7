//! Gateway session
//!
//! One [`GatewaySession`] owns the socket of one shard and drives the
//! handshake, heartbeat, resume and reconnect state machine:
//!
//! ```text
//! Connecting -> Identifying | Resuming -> Connected -> Reconnecting -> Connecting
//!                                                  \-> Closed
//! ```
//!
//! Each connection runs a reader (the session task itself), a writer task
//! owning the sink, and a heartbeat task. The writer is fed through a bounded
//! channel shared by the heartbeat task, the reader and outbound commands.

pub mod heartbeat;
pub mod state;

use crate::error::GatewayError;
use crate::handler::{EventHandler, LifecycleEvent};
use crate::identify::IdentifyLimiter;
use crate::inflate::ZlibStreamDecoder;
use crate::protocol::{
    invalidates_session, is_fatal_code, GatewayMessage, HelloPayload, IdentifyPayload,
    IdentifyProperties, OpCode, PresenceUpdatePayload, ReadyPayload, RequestGuildMembersPayload,
    ResumePayload, DEFAULT_LARGE_THRESHOLD,
};
use chat_common::ClientConfig;
use chat_core::Intents;
use chat_http::{gateway_url, HttpClient};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota};
use heartbeat::HeartbeatSignal;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub use heartbeat::{LatencyTracker, LATENCY_SAMPLES};
pub use state::{SessionState, SessionStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code sent when we drop a connection we intend to resume
const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Close code reported when the server closed without a status
const NO_STATUS_CLOSE_CODE: u16 = 1005;

/// Gateway session configuration
#[derive(Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: Intents,
    pub api_version: u8,
    /// Request zlib-stream transport compression
    pub compress: bool,
    pub large_threshold: u32,
    pub properties: IdentifyProperties,
    /// Presence sent with IDENTIFY
    pub presence: Option<PresenceUpdatePayload>,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,
    /// Consecutive attempts without READY/RESUMED before giving up
    pub max_reconnect_attempts: u32,
    /// How long the writer may flush after the connection is torn down
    pub close_grace_period: Duration,
    pub outgoing_buffer: usize,
    /// Client-initiated commands allowed per minute
    pub commands_per_minute: u32,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            ..Self::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: Intents::DEFAULT,
            api_version: 10,
            compress: true,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            properties: IdentifyProperties::new(),
            presence: None,
            reconnect_backoff_min: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            close_grace_period: Duration::from_secs(5),
            outgoing_buffer: 100,
            commands_per_minute: 120,
        }
    }
}

impl From<&ClientConfig> for GatewayConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            token: config.token.clone(),
            intents: config.intents,
            api_version: config.api_version,
            compress: config.gateway_compress,
            large_threshold: config.large_threshold,
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("api_version", &self.api_version)
            .field("compress", &self.compress)
            .field("large_threshold", &self.large_threshold)
            .field("reconnect_backoff_min", &self.reconnect_backoff_min)
            .field("reconnect_backoff_max", &self.reconnect_backoff_max)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

/// Why a connection ended
#[derive(Debug)]
enum Disconnect {
    /// `stop()` was called
    Shutdown,
    /// Close frame from the server
    Closed { code: u16, reason: String },
    /// op 7
    Reconnect,
    /// op 9
    InvalidSession { resumable: bool },
    /// Heartbeat went unacknowledged
    Zombied,
    /// Stream ended without a close frame
    Dropped,
    Failed(GatewayError),
}

impl Disconnect {
    fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Per-connection handles, dropped when the connection ends
struct Connection {
    outgoing: mpsc::Sender<Message>,
    signals: mpsc::Sender<HeartbeatSignal>,
    heartbeat: Option<JoinHandle<()>>,
    decoder: Option<ZlibStreamDecoder>,
    established: bool,
}

/// Persistent gateway connection for one shard
pub struct GatewaySession {
    shard_id: u32,
    total_shards: u32,
    config: GatewayConfig,
    state: Arc<Mutex<SessionState>>,
    status: watch::Sender<SessionStatus>,
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    shutdown: watch::Sender<bool>,
    handler: Arc<dyn EventHandler>,
    identify: Arc<IdentifyLimiter>,
    commands: DefaultDirectRateLimiter,
    running: AtomicBool,
}

impl GatewaySession {
    pub fn new(
        shard_id: u32,
        total_shards: u32,
        config: GatewayConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.commands_per_minute).unwrap_or(NonZeroU32::MIN);

        Self {
            shard_id,
            total_shards,
            state: Arc::new(Mutex::new(SessionState::new(shard_id, total_shards))),
            status: watch::Sender::new(SessionStatus::Connecting),
            outgoing: Mutex::new(None),
            shutdown: watch::Sender::new(false),
            handler,
            identify: Arc::new(IdentifyLimiter::new(1)),
            commands: governor::RateLimiter::direct(Quota::per_minute(per_minute)),
            running: AtomicBool::new(false),
            config,
        }
    }

    /// Share an IDENTIFY limiter with other shards
    #[must_use]
    pub fn with_identify_limiter(mut self, limiter: Arc<IdentifyLimiter>) -> Self {
        self.identify = limiter;
        self
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch status transitions
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Round trip of the most recent heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.state.lock().latency.latest()
    }

    /// Mean heartbeat round trip over the last few samples
    pub fn average_latency(&self) -> Option<Duration> {
        self.state.lock().latency.average()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.state.lock().sequence
    }

    /// Wait until the shard has received READY or RESUMED
    ///
    /// Fails with [`GatewayError::SessionClosed`] if the session reaches
    /// `Closed` first.
    pub async fn wait_until_ready(&self) -> Result<(), GatewayError> {
        let mut status = self.status.subscribe();
        let reached = status
            .wait_for(|s| matches!(s, SessionStatus::Connected | SessionStatus::Closed))
            .await
            .map(|s| *s)
            .map_err(|_| GatewayError::SessionClosed)?;

        match reached {
            SessionStatus::Connected => Ok(()),
            _ => Err(GatewayError::SessionClosed),
        }
    }

    /// Resolve the gateway URL over REST, then run the session
    pub async fn start_with_http(&self, http: &HttpClient) -> Result<(), GatewayError> {
        let url = http.get_gateway().await?;
        self.start(&url).await
    }

    /// Run the session until `stop()` or a fatal close
    ///
    /// Resumable disconnects are handled internally. Returns `Ok` after a
    /// requested stop and the fatal error otherwise.
    pub async fn start(&self, url: &str) -> Result<(), GatewayError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyRunning);
        }

        let result = self.run(url).await;

        self.outgoing.lock().take();
        self.set_status(SessionStatus::Closed);
        self.running.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => tracing::info!(shard_id = self.shard_id, "Gateway session stopped"),
            Err(e) => tracing::error!(shard_id = self.shard_id, error = %e, "Gateway session failed"),
        }
        result
    }

    /// Stop the session
    ///
    /// Cancels the heartbeat and reader, then waits (bounded by the close
    /// grace period) for the session to reach `Closed`. Stopping is final.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        if !self.running.load(Ordering::SeqCst) {
            self.set_status(SessionStatus::Closed);
            return;
        }

        let mut status = self.status.subscribe();
        let closed = status.wait_for(|s| *s == SessionStatus::Closed);
        // writer flush plus some slack for the reader to notice
        let bound = self.config.close_grace_period + Duration::from_secs(1);
        if tokio::time::timeout(bound, closed).await.is_err() {
            tracing::warn!(shard_id = self.shard_id, "Session did not close in time");
        }
    }

    /// Send op 3 on the live connection
    pub async fn update_presence(
        &self,
        presence: &PresenceUpdatePayload,
    ) -> Result<(), GatewayError> {
        if !presence.is_valid_status() {
            return Err(GatewayError::InvalidStatus(presence.status.clone()));
        }
        self.send_command(GatewayMessage::presence_update(presence)?)
            .await
    }

    /// Send op 8 on the live connection
    pub async fn request_guild_members(
        &self,
        request: &RequestGuildMembersPayload,
    ) -> Result<(), GatewayError> {
        self.send_command(GatewayMessage::request_guild_members(request)?)
            .await
    }

    async fn send_command(&self, message: GatewayMessage) -> Result<(), GatewayError> {
        let outgoing = self
            .outgoing
            .lock()
            .clone()
            .ok_or(GatewayError::NotConnected)?;

        self.commands.until_ready().await;
        tracing::debug!(shard_id = self.shard_id, op = %message.op, "Sending command");
        outgoing
            .send(Message::Text(message.to_json()?))
            .await
            .map_err(|_| GatewayError::NotConnected)
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!(
                shard_id = self.shard_id,
                from = %previous,
                to = %status,
                "Session status changed"
            );
        }
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Reconnect loop
    async fn run(&self, initial_url: &str) -> Result<(), GatewayError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }
            self.set_status(SessionStatus::Connecting);

            let resuming = self.state.lock().can_resume();
            if !resuming {
                tokio::select! {
                    () = self.identify.wait(self.shard_id) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
            }

            let url = self.connect_url(initial_url);
            let (disconnect, established) = self.connect_once(&url, &mut shutdown).await;
            let code = disconnect.close_code();

            match disconnect {
                Disconnect::Shutdown => return Ok(()),
                Disconnect::Closed { code, reason } if is_fatal_code(code) => {
                    tracing::error!(
                        shard_id = self.shard_id,
                        code,
                        reason = %reason,
                        "Gateway closed with a fatal code"
                    );
                    self.handler
                        .lifecycle(self.shard_id, LifecycleEvent::Disconnected { code: Some(code) })
                        .await;
                    return Err(GatewayError::closed(code, reason));
                }
                Disconnect::Closed { code, reason } => {
                    if invalidates_session(code) {
                        self.state.lock().clear_session();
                    }
                    tracing::info!(shard_id = self.shard_id, code, reason = %reason, "Gateway closed the connection");
                }
                Disconnect::InvalidSession { resumable } => {
                    if !resumable {
                        self.state.lock().clear_session();
                    }
                    tracing::info!(shard_id = self.shard_id, resumable, "Session invalidated");
                }
                Disconnect::Reconnect => {
                    tracing::info!(shard_id = self.shard_id, "Gateway requested a reconnect");
                }
                Disconnect::Zombied => {
                    tracing::warn!(shard_id = self.shard_id, "Reconnecting zombied connection");
                }
                Disconnect::Dropped => {
                    tracing::warn!(shard_id = self.shard_id, "Gateway connection dropped");
                }
                Disconnect::Failed(e) => {
                    tracing::warn!(shard_id = self.shard_id, error = %e, "Gateway connection failed");
                }
            }

            if established {
                failures = 0;
            } else {
                failures += 1;
                if failures >= self.config.max_reconnect_attempts {
                    return Err(GatewayError::ReconnectExhausted { attempts: failures });
                }
            }

            self.handler
                .lifecycle(self.shard_id, LifecycleEvent::Disconnected { code })
                .await;
            self.set_status(SessionStatus::Reconnecting);
            self.handler
                .lifecycle(
                    self.shard_id,
                    LifecycleEvent::Reconnecting {
                        attempt: failures + 1,
                    },
                )
                .await;

            let delay = self.reconnect_delay();
            tracing::debug!(
                shard_id = self.shard_id,
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnecting"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn reconnect_delay(&self) -> Duration {
        let min = self.config.reconnect_backoff_min;
        let max = self.config.reconnect_backoff_max.max(min);
        if min == max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    /// Resume against the URL READY handed out, otherwise the initial one
    fn connect_url(&self, initial: &str) -> String {
        let state = self.state.lock();
        let base = match (&state.resume_gateway_url, state.can_resume()) {
            (Some(resume), true) => resume.as_str(),
            _ => initial,
        };
        gateway_url(base, self.config.api_version, self.config.compress)
    }

    /// Open one connection and read it until it ends
    ///
    /// Returns why the connection ended and whether it reached READY or
    /// RESUMED.
    async fn connect_once(
        &self,
        url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> (Disconnect, bool) {
        tracing::info!(shard_id = self.shard_id, url = %url, "Connecting to gateway");

        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url) => result,
            _ = shutdown.changed() => return (Disconnect::Shutdown, false),
        };
        let stream = match connected {
            Ok((stream, _response)) => stream,
            Err(e) => return (Disconnect::Failed(e.into()), false),
        };

        let (sink, mut stream) = stream.split();
        let (out_tx, out_rx) = mpsc::channel(self.config.outgoing_buffer.max(1));
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        let writer = tokio::spawn(write_loop(self.shard_id, sink, out_rx));

        *self.outgoing.lock() = Some(out_tx.clone());
        self.state.lock().latency.reset();

        let mut conn = Connection {
            outgoing: out_tx,
            signals: signal_tx,
            heartbeat: None,
            decoder: self.config.compress.then(ZlibStreamDecoder::new),
            established: false,
        };
        self.handler
            .lifecycle(self.shard_id, LifecycleEvent::Connected)
            .await;

        let disconnect = loop {
            tokio::select! {
                _ = shutdown.changed() => break Disconnect::Shutdown,
                Some(signal) = signal_rx.recv() => match signal {
                    HeartbeatSignal::Zombied => break Disconnect::Zombied,
                },
                frame = stream.next() => match frame {
                    None => break Disconnect::Dropped,
                    Some(Err(e)) => break Disconnect::Failed(e.into()),
                    Some(Ok(frame)) => {
                        if let Some(disconnect) = self.handle_frame(frame, &mut conn).await {
                            break disconnect;
                        }
                    }
                },
            }
        };

        self.teardown(conn, writer, disconnect).await
    }

    async fn teardown(
        &self,
        mut conn: Connection,
        mut writer: JoinHandle<()>,
        disconnect: Disconnect,
    ) -> (Disconnect, bool) {
        if let Some(heartbeat) = conn.heartbeat.take() {
            heartbeat.abort();
        }
        self.outgoing.lock().take();
        let deadline = tokio::time::Instant::now() + self.config.close_grace_period;

        // a non-1000 code keeps the session resumable
        let close = match &disconnect {
            Disconnect::Shutdown => Some(WsCloseCode::Normal),
            Disconnect::Reconnect | Disconnect::InvalidSession { .. } | Disconnect::Zombied => {
                Some(WsCloseCode::from(RESUMABLE_CLOSE_CODE))
            }
            Disconnect::Closed { .. } | Disconnect::Dropped | Disconnect::Failed(_) => None,
        };
        if let Some(code) = close {
            let frame = CloseFrame {
                code,
                reason: "".into(),
            };
            if !queue_close(&conn.outgoing, frame, self.config.close_grace_period).await {
                tracing::warn!(
                    shard_id = self.shard_id,
                    code = u16::from(code),
                    "Close frame could not be queued, connection closes without it"
                );
            }
        }

        let established = conn.established;
        drop(conn);

        if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
            tracing::warn!(shard_id = self.shard_id, "Writer did not finish within the grace period");
            writer.abort();
        }

        (disconnect, established)
    }

    /// Decode one WebSocket frame into a gateway message and handle it
    async fn handle_frame(&self, frame: Message, conn: &mut Connection) -> Option<Disconnect> {
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match conn.decoder.as_mut() {
                Some(decoder) => match decoder.push(&data) {
                    Ok(Some(text)) => text,
                    Ok(None) => return None,
                    Err(e) => return Some(Disconnect::Failed(e.into())),
                },
                None => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(shard_id = self.shard_id, error = %e, "Dropping non UTF-8 frame");
                        return None;
                    }
                },
            },
            Message::Close(frame) => {
                let (code, reason) = frame.map_or((NO_STATUS_CLOSE_CODE, String::new()), |f| {
                    (u16::from(f.code), f.reason.into_owned())
                });
                return Some(Disconnect::Closed { code, reason });
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return None,
        };

        let message = match GatewayMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(shard_id = self.shard_id, error = %e, "Dropping undecodable gateway payload");
                return None;
            }
        };

        tracing::trace!(shard_id = self.shard_id, message = %message, "Received");
        self.handle_message(message, conn).await
    }

    async fn handle_message(
        &self,
        message: GatewayMessage,
        conn: &mut Connection,
    ) -> Option<Disconnect> {
        match message.op {
            OpCode::Dispatch => {
                self.handle_dispatch(message, conn).await;
                None
            }
            OpCode::Heartbeat => {
                let sequence = self.state.lock().sequence;
                self.send_frame(&conn.outgoing, &GatewayMessage::heartbeat(sequence))
                    .await;
                None
            }
            OpCode::Reconnect => Some(Disconnect::Reconnect),
            OpCode::InvalidSession => Some(Disconnect::InvalidSession {
                resumable: message.invalid_session_resumable().unwrap_or(false),
            }),
            OpCode::Hello => self.handle_hello(&message, conn).await,
            OpCode::HeartbeatAck => {
                let sample = self.state.lock().latency.ack();
                if let Some(latency) = sample {
                    tracing::trace!(
                        shard_id = self.shard_id,
                        latency_ms = latency.as_millis() as u64,
                        "Heartbeat acknowledged"
                    );
                }
                None
            }
            OpCode::Identify
            | OpCode::PresenceUpdate
            | OpCode::VoiceStateUpdate
            | OpCode::Resume
            | OpCode::RequestGuildMembers => {
                tracing::warn!(shard_id = self.shard_id, op = %message.op, "Server sent a client op code");
                None
            }
        }
    }

    async fn handle_hello(
        &self,
        message: &GatewayMessage,
        conn: &mut Connection,
    ) -> Option<Disconnect> {
        let hello = match HelloPayload::deserialize(&message.d) {
            Ok(hello) => hello,
            Err(e) => return Some(Disconnect::Failed(e.into())),
        };
        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.state.lock().heartbeat_interval = Some(interval);

        if let Some(previous) = conn.heartbeat.take() {
            previous.abort();
        }
        conn.heartbeat = Some(heartbeat::spawn(
            self.shard_id,
            interval,
            Arc::clone(&self.state),
            conn.outgoing.clone(),
            conn.signals.clone(),
        ));

        let resume = {
            let state = self.state.lock();
            state.session_id.clone().zip(state.sequence)
        };

        let handshake = match resume {
            Some((session_id, seq)) => {
                let payload = ResumePayload {
                    token: self.config.token.clone(),
                    session_id,
                    seq,
                };
                tracing::info!(
                    shard_id = self.shard_id,
                    session_id = %payload.session_id,
                    seq = payload.seq,
                    "Resuming session"
                );
                self.set_status(SessionStatus::Resuming);
                GatewayMessage::resume(&payload)
            }
            None => {
                tracing::info!(
                    shard_id = self.shard_id,
                    total_shards = self.total_shards,
                    "Identifying"
                );
                self.set_status(SessionStatus::Identifying);
                GatewayMessage::identify(&self.identify_payload())
            }
        };

        match handshake {
            Ok(frame) => {
                self.send_frame(&conn.outgoing, &frame).await;
                None
            }
            Err(e) => Some(Disconnect::Failed(e.into())),
        }
    }

    async fn handle_dispatch(&self, message: GatewayMessage, conn: &mut Connection) {
        let Some(event) = message.t.clone() else {
            tracing::warn!(shard_id = self.shard_id, "Dispatch without an event name");
            return;
        };
        if let Some(seq) = message.s {
            self.state.lock().update_sequence(seq);
        }

        let lifecycle = match event.as_str() {
            "READY" => match message.as_ready() {
                Some(ready) => {
                    self.on_ready(ready);
                    Some(LifecycleEvent::ShardReady)
                }
                None => {
                    tracing::warn!(shard_id = self.shard_id, "READY without a session id");
                    None
                }
            },
            "RESUMED" => {
                tracing::info!(shard_id = self.shard_id, "Session resumed");
                Some(LifecycleEvent::Resumed)
            }
            _ => None,
        };
        if lifecycle.is_some() {
            conn.established = true;
            self.set_status(SessionStatus::Connected);
        }

        self.handler
            .dispatch(self.shard_id, &event, message.d)
            .await;

        if let Some(lifecycle) = lifecycle {
            self.handler.lifecycle(self.shard_id, lifecycle).await;
        }
    }

    fn on_ready(&self, ready: ReadyPayload) {
        tracing::info!(
            shard_id = self.shard_id,
            session_id = %ready.session_id,
            "Shard is ready"
        );
        if let Some([id, total]) = ready.shard {
            if id != self.shard_id || total != self.total_shards {
                tracing::warn!(
                    shard_id = self.shard_id,
                    reported = ?ready.shard,
                    "READY reported a different shard"
                );
            }
        }

        let mut state = self.state.lock();
        state.session_id = Some(ready.session_id);
        state.resume_gateway_url = ready.resume_gateway_url;
    }

    fn identify_payload(&self) -> IdentifyPayload {
        IdentifyPayload {
            token: self.config.token.clone(),
            intents: self.config.intents,
            properties: self.config.properties.clone(),
            shard: Some(self.state.lock().shard()),
            large_threshold: self.config.large_threshold,
            presence: self.config.presence.clone(),
        }
    }

    async fn send_frame(&self, outgoing: &mpsc::Sender<Message>, message: &GatewayMessage) {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(shard_id = self.shard_id, error = %e, "Failed to encode frame");
                return;
            }
        };
        if outgoing.send(Message::Text(frame)).await.is_err() {
            tracing::debug!(shard_id = self.shard_id, op = %message.op, "Writer gone, frame dropped");
        }
    }
}

impl std::fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySession")
            .field("shard_id", &self.shard_id)
            .field("total_shards", &self.total_shards)
            .field("status", &self.status())
            .field("config", &self.config)
            .finish()
    }
}

/// Queue a close frame behind pending writes, waiting at most `grace`
async fn queue_close(
    outgoing: &mpsc::Sender<Message>,
    frame: CloseFrame<'static>,
    grace: Duration,
) -> bool {
    let send = outgoing.send(Message::Close(Some(frame)));
    matches!(tokio::time::timeout(grace, send).await, Ok(Ok(())))
}

/// Owns the sink; ends after sending a close frame or once every sender is gone
async fn write_loop(
    shard_id: u32,
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!(shard_id, error = %e, "Gateway write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
