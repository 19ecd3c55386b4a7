//! Payload definitions
//!
//! Typed `d` bodies for the op codes the client sends or interprets.

use chat_core::{Intents, Snowflake};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload for op 10 (Hello)
///
/// Sent by the server immediately after connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

impl HelloPayload {
    /// Default heartbeat interval (45 seconds)
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 45_000;

    /// Create a new Hello payload with default interval
    #[must_use]
    pub fn new() -> Self {
        Self {
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Create a Hello payload with custom interval
    #[must_use]
    pub fn with_interval(heartbeat_interval: u64) -> Self {
        Self { heartbeat_interval }
    }
}

impl Default for HelloPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload for op 2 (Identify)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,

    pub intents: Intents,

    pub properties: IdentifyProperties,

    /// `[shard_id, total_shards]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,

    /// Member count above which offline members are not sent
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,

    /// Initial presence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdatePayload>,
}

/// Default `large_threshold` sent with IDENTIFY
pub const DEFAULT_LARGE_THRESHOLD: u32 = 250;

fn default_large_threshold() -> u32 {
    DEFAULT_LARGE_THRESHOLD
}

/// Client connection properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    /// Operating system
    pub os: String,

    /// Library name
    pub browser: String,

    /// Library name, again
    pub device: String,
}

impl IdentifyProperties {
    /// Properties describing this library on the current platform
    #[must_use]
    pub fn new() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }

    /// Set operating system
    #[must_use]
    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }

    /// Set browser
    #[must_use]
    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = browser.into();
        self
    }

    /// Set device type
    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload for op 3 (Presence Update)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdatePayload {
    /// Unix time (ms) the client went idle
    pub since: Option<u64>,

    /// Activity objects, forwarded verbatim
    #[serde(default)]
    pub activities: Vec<Value>,

    /// online, idle, dnd, invisible or offline
    pub status: String,

    #[serde(default)]
    pub afk: bool,
}

impl PresenceUpdatePayload {
    /// Valid status values
    pub const VALID_STATUSES: &'static [&'static str] =
        &["online", "idle", "dnd", "invisible", "offline"];

    /// Presence with the given status and no activities
    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: status.into(),
            afk: false,
        }
    }

    /// Add an activity object
    #[must_use]
    pub fn with_activity(mut self, activity: Value) -> Self {
        self.activities.push(activity);
        self
    }

    /// Check if the status is valid
    #[must_use]
    pub fn is_valid_status(&self) -> bool {
        Self::VALID_STATUSES.contains(&self.status.as_str())
    }
}

/// Payload for op 6 (Resume)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,

    /// Session ID to resume
    pub session_id: String,

    /// Last received sequence number
    pub seq: u64,
}

/// Payload for op 8 (Request Guild Members)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGuildMembersPayload {
    pub guild_id: Snowflake,

    /// Username prefix; empty string requests every member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Maximum number of members to return (0 = no limit)
    #[serde(default)]
    pub limit: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<Snowflake>,

    /// Echoed back in the resulting GUILD_MEMBERS_CHUNK events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl RequestGuildMembersPayload {
    /// Request every member of a guild
    #[must_use]
    pub fn all(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            query: Some(String::new()),
            limit: 0,
            presences: None,
            user_ids: Vec::new(),
            nonce: None,
        }
    }

    /// Request specific members by id
    #[must_use]
    pub fn by_ids(guild_id: Snowflake, user_ids: Vec<Snowflake>) -> Self {
        Self {
            guild_id,
            query: None,
            limit: 0,
            presences: None,
            user_ids,
            nonce: None,
        }
    }

    /// Set the nonce
    #[must_use]
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

/// The fields of the READY dispatch the session itself consumes
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,

    #[serde(default)]
    pub resume_gateway_url: Option<String>,

    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}
