//! Shard manager
//!
//! Owns one [`GatewaySession`] per shard, sequences their startup around the
//! server's IDENTIFY concurrency and reports when every shard is ready.

use crate::error::GatewayError;
use crate::handler::{EventHandler, LifecycleEvent};
use crate::identify::{IdentifyLimiter, DEFAULT_IDENTIFY_SPACING};
use crate::session::{GatewayConfig, GatewaySession};
use chat_common::ClientConfig;
use chat_core::Snowflake;
use chat_http::{HttpClient, HttpClientConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type ShardTask = JoinHandle<Result<(), GatewayError>>;

#[derive(Debug, Clone)]
pub struct ShardManagerConfig {
    /// Explicit shard count; `None` uses the server recommendation
    pub total_shards: Option<u32>,
    pub gateway: GatewayConfig,
    /// Gap between IDENTIFYs sharing a rate-limit key
    pub identify_spacing: Duration,
}

impl ShardManagerConfig {
    pub fn new(gateway: GatewayConfig) -> Self {
        Self {
            total_shards: None,
            gateway,
            identify_spacing: DEFAULT_IDENTIFY_SPACING,
        }
    }
}

impl From<&ClientConfig> for ShardManagerConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            total_shards: config.total_shards,
            ..Self::new(GatewayConfig::from(config))
        }
    }
}

pub struct ShardManager {
    http: Arc<HttpClient>,
    handler: Arc<dyn EventHandler>,
    config: ShardManagerConfig,
    shards: RwLock<Vec<Arc<GatewaySession>>>,
    tasks: Mutex<Vec<ShardTask>>,
    total_shards: AtomicU32,
    ready: watch::Sender<bool>,
}

impl ShardManager {
    pub fn new(
        http: Arc<HttpClient>,
        config: ShardManagerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            http,
            handler,
            config,
            shards: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            total_shards: AtomicU32::new(0),
            ready: watch::Sender::new(false),
        }
    }

    /// Build the REST client and manager from one client config
    pub fn from_config(
        config: &ClientConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, GatewayError> {
        let http = HttpClient::new(HttpClientConfig::from(config))?;
        http.set_token(config.token.clone());
        Ok(Self::new(
            Arc::new(http),
            ShardManagerConfig::from(config),
            handler,
        ))
    }

    pub fn http(&self) -> &Arc<HttpClient> {
        &self.http
    }

    /// Number of shards; 0 before `start()`
    pub fn total_shards(&self) -> u32 {
        self.total_shards.load(Ordering::SeqCst)
    }

    pub fn shards(&self) -> Vec<Arc<GatewaySession>> {
        self.shards.read().clone()
    }

    pub fn shard(&self, shard_id: u32) -> Option<Arc<GatewaySession>> {
        self.shards.read().get(shard_id as usize).cloned()
    }

    /// Shard that receives events for a guild
    pub fn shard_for_guild(&self, guild_id: Snowflake) -> u32 {
        guild_id.shard_id(self.total_shards())
    }

    pub fn session_for_guild(&self, guild_id: Snowflake) -> Option<Arc<GatewaySession>> {
        self.shard(self.shard_for_guild(guild_id))
    }

    /// Every shard has reported READY
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Latest heartbeat round trip per shard
    pub fn latencies(&self) -> Vec<(u32, Option<Duration>)> {
        self.shards
            .read()
            .iter()
            .map(|shard| (shard.shard_id(), shard.latency()))
            .collect()
    }

    /// Mean of the shards' rolling averages
    pub fn average_latency(&self) -> Option<Duration> {
        let samples: Vec<Duration> = self
            .shards
            .read()
            .iter()
            .filter_map(|shard| shard.average_latency())
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    /// Start every shard and wait until all of them are ready
    ///
    /// Shards are grouped by `shard_id % max_concurrency`; groups start one
    /// after another and shards inside a group IDENTIFY `identify_spacing`
    /// apart. If a shard fails before READY, every shard is stopped and its
    /// error returned.
    pub async fn start(&self) -> Result<(), GatewayError> {
        if !self.shards.read().is_empty() {
            return Err(GatewayError::AlreadyRunning);
        }

        let gateway = self.http.get_gateway_bot().await?;
        let total = match self.config.total_shards {
            Some(configured) if configured > 0 => {
                if configured != gateway.shards {
                    tracing::info!(
                        configured,
                        recommended = gateway.shards,
                        "Using configured shard count instead of the recommendation"
                    );
                }
                configured
            }
            _ => gateway.shards.max(1),
        };
        let max_concurrency = gateway.session_start_limit.max_concurrency.max(1);
        let limiter = Arc::new(IdentifyLimiter::with_spacing(
            max_concurrency,
            self.config.identify_spacing,
        ));

        let sessions: Vec<Arc<GatewaySession>> = (0..total)
            .map(|shard_id| {
                Arc::new(
                    GatewaySession::new(
                        shard_id,
                        total,
                        self.config.gateway.clone(),
                        Arc::clone(&self.handler),
                    )
                    .with_identify_limiter(Arc::clone(&limiter)),
                )
            })
            .collect();
        *self.shards.write() = sessions.clone();
        self.total_shards.store(total, Ordering::SeqCst);

        tracing::info!(
            total_shards = total,
            max_concurrency,
            session_starts_remaining = gateway.session_start_limit.remaining,
            "Starting shards"
        );

        let mut groups: BTreeMap<u32, Vec<Arc<GatewaySession>>> = BTreeMap::new();
        for session in &sessions {
            groups
                .entry(session.shard_id() % max_concurrency)
                .or_default()
                .push(Arc::clone(session));
        }

        for (key, group) in groups {
            tracing::debug!(key, shards = group.len(), "Starting shard group");

            let mut pending = Vec::with_capacity(group.len());
            for session in group {
                let url = gateway.url.clone();
                let runner = Arc::clone(&session);
                let task = tokio::spawn(async move { runner.start(&url).await });
                pending.push((session, task));
            }

            for (session, task) in pending {
                if session.wait_until_ready().await.is_ok() {
                    self.tasks.lock().push(task);
                    continue;
                }

                let error = match task.await {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => GatewayError::SessionClosed,
                    Err(e) => {
                        tracing::error!(shard_id = session.shard_id(), error = %e, "Shard task panicked");
                        GatewayError::SessionClosed
                    }
                };
                tracing::error!(
                    shard_id = session.shard_id(),
                    error = %error,
                    "Shard failed to start"
                );
                self.stop().await;
                return Err(error);
            }
        }

        self.ready.send_replace(true);
        tracing::info!(total_shards = total, "All shards ready");
        self.handler
            .lifecycle(0, LifecycleEvent::ClientReady { shards: total })
            .await;
        Ok(())
    }

    /// Wait for every shard task to finish
    ///
    /// Returns the first shard error, if any.
    pub async fn join(&self) -> Result<(), GatewayError> {
        let tasks: Vec<ShardTask> = std::mem::take(&mut *self.tasks.lock());
        let mut first_error = None;

        for task in tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "Shard task panicked");
                    Err(GatewayError::SessionClosed)
                }
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Stop every shard concurrently, then close the REST client
    pub async fn stop(&self) {
        self.ready.send_replace(false);
        let shards = self.shards();
        futures_util::future::join_all(shards.iter().map(|shard| shard.stop())).await;
        self.http.close();
        tracing::info!(shards = shards.len(), "Shard manager stopped");
    }
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("total_shards", &self.total_shards())
            .field("ready", &self.is_ready())
            .field("config", &self.config)
            .finish()
    }
}
