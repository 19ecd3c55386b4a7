//! IDENTIFY concurrency limiter
//!
//! The gateway allows `max_concurrency` IDENTIFYs per spacing window, keyed
//! by `shard_id % max_concurrency`. Each key gets its own slot; a shard
//! waits until its slot's previous IDENTIFY is at least `spacing` old.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default gap between two IDENTIFYs on the same slot
pub const DEFAULT_IDENTIFY_SPACING: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct IdentifyLimiter {
    spacing: Duration,
    slots: Vec<Mutex<Option<Instant>>>,
}

impl IdentifyLimiter {
    pub fn new(max_concurrency: u32) -> Self {
        Self::with_spacing(max_concurrency, DEFAULT_IDENTIFY_SPACING)
    }

    pub fn with_spacing(max_concurrency: u32, spacing: Duration) -> Self {
        let slots = (0..max_concurrency.max(1)).map(|_| Mutex::new(None)).collect();
        Self { spacing, slots }
    }

    pub fn max_concurrency(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Rate-limit key for a shard
    pub fn slot_for(&self, shard_id: u32) -> usize {
        (shard_id % self.max_concurrency()) as usize
    }

    /// Wait for permission to IDENTIFY
    ///
    /// Shards sharing a slot queue in FIFO order.
    pub async fn wait(&self, shard_id: u32) {
        let slot = self.slot_for(shard_id);
        let mut last = self.slots[slot].lock().await;

        if let Some(previous) = *last {
            let ready_at = previous + self.spacing;
            if ready_at > Instant::now() {
                tracing::debug!(
                    shard_id,
                    slot,
                    wait_ms = ready_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Waiting for identify slot"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last = Some(Instant::now());
    }
}
