//! # chat-gateway
//!
//! Gateway side of the client: the wire protocol, zlib-stream decoding, one
//! [`GatewaySession`] per shard and the [`ShardManager`] that starts them
//! within the IDENTIFY concurrency limit.

pub mod error;
pub mod handler;
pub mod identify;
pub mod inflate;
pub mod protocol;
pub mod session;
pub mod shard;

pub use error::GatewayError;
pub use handler::{ChannelHandler, EventHandler, GatewayEvent, LifecycleEvent, NoopHandler};
pub use identify::{IdentifyLimiter, DEFAULT_IDENTIFY_SPACING};
pub use inflate::{InflateError, ZlibStreamDecoder, ZLIB_SUFFIX};
pub use session::{GatewayConfig, GatewaySession, LatencyTracker, SessionState, SessionStatus};
pub use shard::{ShardManager, ShardManagerConfig};
