//! Value objects - immutable types shared by the REST and gateway layers

mod intents;
mod snowflake;

pub use intents::{Intents, IntentsParseError};
pub use snowflake::{Snowflake, SnowflakeParseError};
