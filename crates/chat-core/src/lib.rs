//! # chat-core
//!
//! Value objects shared by the REST client and the gateway: snowflake ids
//! (with guild → shard routing) and gateway intents.
//! This crate has no dependency on any network stack.

pub mod value_objects;

// Re-export commonly used types at crate root
pub use value_objects::{Intents, IntentsParseError, Snowflake, SnowflakeParseError};
