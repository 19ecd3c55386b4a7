//! Event handler seam
//!
//! Sessions hand every DISPATCH to an [`EventHandler`] together with
//! connection lifecycle notifications. Caches and event routers live behind
//! this trait.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// WebSocket opened
    Connected,
    /// WebSocket closed; `code` is the close code when the server sent one
    Disconnected { code: Option<u16> },
    /// Backing off before connection attempt `attempt`
    Reconnecting { attempt: u32 },
    /// RESUMED received
    Resumed,
    /// READY received for this shard
    ShardReady,
    /// Every shard has reported READY (reported on shard 0)
    ClientReady { shards: u32 },
}

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Called for every DISPATCH, in sequence order per shard
    async fn dispatch(&self, shard_id: u32, event: &str, payload: Value);

    async fn lifecycle(&self, shard_id: u32, event: LifecycleEvent) {
        let _ = (shard_id, event);
    }
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {
    async fn dispatch(&self, _shard_id: u32, _event: &str, _payload: Value) {}
}

/// Everything a [`ChannelHandler`] forwards
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Dispatch {
        shard_id: u32,
        event: String,
        payload: Value,
    },
    Lifecycle {
        shard_id: u32,
        event: LifecycleEvent,
    },
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn dispatch(&self, shard_id: u32, event: &str, payload: Value) {
        let _ = self.tx.send(GatewayEvent::Dispatch {
            shard_id,
            event: event.to_string(),
            payload,
        });
    }

    async fn lifecycle(&self, shard_id: u32, event: LifecycleEvent) {
        let _ = self.tx.send(GatewayEvent::Lifecycle { shard_id, event });
    }
}
