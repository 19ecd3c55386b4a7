//! Heartbeat loop and latency tracking

use super::state::SessionState;
use crate::protocol::GatewayMessage;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

/// Number of ACK round trips kept for the rolling average
pub const LATENCY_SAMPLES: usize = 10;

/// Heartbeat send/ACK bookkeeping
#[derive(Debug, Default)]
pub struct LatencyTracker {
    last_send: Option<Instant>,
    last_ack: Option<Instant>,
    awaiting_ack: bool,
    samples: VecDeque<Duration>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&mut self) {
        self.last_send = Some(Instant::now());
        self.awaiting_ack = true;
    }

    /// Record an ACK, returning the round trip if a heartbeat was outstanding
    pub fn ack(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.last_ack = Some(now);
        if !std::mem::replace(&mut self.awaiting_ack, false) {
            return None;
        }

        let sample = now.saturating_duration_since(self.last_send?);
        if self.samples.len() == LATENCY_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Some(sample)
    }

    /// A heartbeat was sent and its ACK has not arrived yet
    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn latest(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Start a new connection; samples are kept
    pub fn reset(&mut self) {
        self.last_send = None;
        self.awaiting_ack = false;
    }
}

/// Signals from the heartbeat task to the connection loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatSignal {
    /// A heartbeat came due while the previous one was still unacknowledged
    Zombied,
}

/// Spawn the heartbeat loop for one connection
///
/// The first beat goes out after `interval * jitter`, then every `interval`.
pub(crate) fn spawn(
    shard_id: u32,
    interval: Duration,
    state: Arc<Mutex<SessionState>>,
    outgoing: mpsc::Sender<Message>,
    signals: mpsc::Sender<HeartbeatSignal>,
) -> JoinHandle<()> {
    let jitter: f64 = rand::thread_rng().gen();

    tokio::spawn(async move {
        tokio::time::sleep(interval.mul_f64(jitter)).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let sequence = {
                let mut state = state.lock();
                if state.latency.awaiting_ack() {
                    None
                } else {
                    state.latency.record_send();
                    Some(state.sequence)
                }
            };

            let Some(sequence) = sequence else {
                tracing::warn!(
                    shard_id,
                    interval_ms = interval.as_millis() as u64,
                    "No heartbeat ACK since the last beat, connection is zombied"
                );
                let _ = signals.send(HeartbeatSignal::Zombied).await;
                return;
            };

            let frame = match GatewayMessage::heartbeat(sequence).to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(shard_id, error = %e, "Failed to encode heartbeat");
                    return;
                }
            };

            tracing::trace!(shard_id, seq = ?sequence, "Sending heartbeat");
            if outgoing.send(Message::Text(frame)).await.is_err() {
                tracing::debug!(shard_id, "Writer gone, stopping heartbeat");
                return;
            }
        }
    })
}
