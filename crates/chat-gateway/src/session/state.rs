//! Per-shard session state

use super::heartbeat::LatencyTracker;
use std::time::Duration;

/// Lifecycle status of a gateway session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Socket being opened, or open and waiting for HELLO
    Connecting,
    /// IDENTIFY sent, waiting for READY
    Identifying,
    /// RESUME sent, waiting for RESUMED
    Resuming,
    /// READY or RESUMED received
    Connected,
    /// Socket closed, waiting out the backoff before the next attempt
    Reconnecting,
    /// Terminal
    Closed,
}

impl SessionStatus {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// State that outlives a single connection
///
/// `session_id`, `sequence` and `resume_gateway_url` survive a resumable
/// disconnect and are cleared together on a non-resumable one.
#[derive(Debug)]
pub struct SessionState {
    pub shard_id: u32,
    pub total_shards: u32,
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    pub resume_gateway_url: Option<String>,
    pub heartbeat_interval: Option<Duration>,
    pub latency: LatencyTracker,
}

impl SessionState {
    pub fn new(shard_id: u32, total_shards: u32) -> Self {
        Self {
            shard_id,
            total_shards,
            sequence: None,
            session_id: None,
            resume_gateway_url: None,
            heartbeat_interval: None,
            latency: LatencyTracker::new(),
        }
    }

    /// A RESUME needs both a session id and a sequence number
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Forget the session so the next connection sends IDENTIFY
    pub fn clear_session(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_gateway_url = None;
    }

    /// Record a dispatch sequence number
    ///
    /// Never moves backwards; returns `false` for a stale or replayed number.
    pub fn update_sequence(&mut self, seq: u64) -> bool {
        match self.sequence {
            Some(current) if seq <= current => false,
            _ => {
                self.sequence = Some(seq);
                true
            }
        }
    }

    /// `[shard_id, total_shards]` as sent in IDENTIFY
    pub fn shard(&self) -> [u32; 2] {
        [self.shard_id, self.total_shards]
    }
}
