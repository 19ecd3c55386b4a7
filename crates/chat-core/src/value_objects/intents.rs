//! Gateway intents bitflags
//!
//! Intents select which event families the gateway delivers to a shard.
//! Three of them are privileged and must be enabled for the application
//! before IDENTIFY, otherwise the connection is closed with 4014.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

bitflags! {
    /// Gateway intent flags sent in IDENTIFY
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Intents: u64 {
        /// Guild create/update/delete, roles, channels, threads
        const GUILDS                    = 1 << 0;
        /// Member add/update/remove (privileged)
        const GUILD_MEMBERS             = 1 << 1;
        /// Bans and audit log entries
        const GUILD_MODERATION          = 1 << 2;
        const GUILD_EMOJIS_AND_STICKERS = 1 << 3;
        const GUILD_INTEGRATIONS        = 1 << 4;
        const GUILD_WEBHOOKS            = 1 << 5;
        const GUILD_INVITES             = 1 << 6;
        const GUILD_VOICE_STATES        = 1 << 7;
        /// Presence updates (privileged)
        const GUILD_PRESENCES           = 1 << 8;
        const GUILD_MESSAGES            = 1 << 9;
        const GUILD_MESSAGE_REACTIONS   = 1 << 10;
        const GUILD_MESSAGE_TYPING      = 1 << 11;
        const DIRECT_MESSAGES           = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS  = 1 << 13;
        const DIRECT_MESSAGE_TYPING     = 1 << 14;
        /// Message content in guild messages (privileged)
        const MESSAGE_CONTENT           = 1 << 15;
        const GUILD_SCHEDULED_EVENTS    = 1 << 16;

        /// Intents that need explicit approval for the application
        const PRIVILEGED = Self::GUILD_MEMBERS.bits()
            | Self::GUILD_PRESENCES.bits()
            | Self::MESSAGE_CONTENT.bits();

        /// Every non-privileged intent
        const DEFAULT = Self::GUILDS.bits()
            | Self::GUILD_MODERATION.bits()
            | Self::GUILD_EMOJIS_AND_STICKERS.bits()
            | Self::GUILD_INTEGRATIONS.bits()
            | Self::GUILD_WEBHOOKS.bits()
            | Self::GUILD_INVITES.bits()
            | Self::GUILD_VOICE_STATES.bits()
            | Self::GUILD_MESSAGES.bits()
            | Self::GUILD_MESSAGE_REACTIONS.bits()
            | Self::GUILD_MESSAGE_TYPING.bits()
            | Self::DIRECT_MESSAGES.bits()
            | Self::DIRECT_MESSAGE_REACTIONS.bits()
            | Self::DIRECT_MESSAGE_TYPING.bits()
            | Self::GUILD_SCHEDULED_EVENTS.bits();
    }
}

/// Error when parsing intents from a string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntentsParseError {
    #[error("unknown intent: {0}")]
    UnknownIntent(String),
}

impl Intents {
    /// Whether any privileged intent is requested
    #[inline]
    pub fn is_privileged(&self) -> bool {
        self.intersects(Intents::PRIVILEGED)
    }

    /// Parse from a decimal bitfield (`"33281"`) or a `|`-separated list of
    /// names (`"GUILDS | GUILD_MESSAGES"`)
    pub fn parse(s: &str) -> Result<Self, IntentsParseError> {
        let s = s.trim();
        if let Ok(bits) = s.parse::<u64>() {
            return Ok(Intents::from_bits_truncate(bits));
        }

        s.split('|')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .try_fold(Intents::empty(), |acc, name| {
                Intents::from_name(&name.to_ascii_uppercase())
                    .map(|flag| acc | flag)
                    .ok_or_else(|| IntentsParseError::UnknownIntent(name.to_string()))
            })
    }
}

impl Default for Intents {
    fn default() -> Self {
        Intents::DEFAULT
    }
}

impl fmt::Display for Intents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

impl std::str::FromStr for Intents {
    type Err = IntentsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Intents::parse(s)
    }
}

// IDENTIFY carries intents as a plain integer
impl Serialize for Intents {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct IntentsVisitor;

        impl Visitor<'_> for IntentsVisitor {
            type Value = Intents;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an integer or string representing intent bits")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Intents, E>
            where
                E: de::Error,
            {
                Ok(Intents::from_bits_truncate(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Intents, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(Intents::from_bits_truncate)
                    .map_err(|_| de::Error::custom("negative intents"))
            }

            fn visit_str<E>(self, value: &str) -> Result<Intents, E>
            where
                E: de::Error,
            {
                Intents::parse(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(IntentsVisitor)
    }
}

impl From<u64> for Intents {
    fn from(bits: u64) -> Self {
        Intents::from_bits_truncate(bits)
    }
}

impl From<Intents> for u64 {
    fn from(intents: Intents) -> Self {
        intents.bits()
    }
}
