//! Gateway protocol definitions
//!
//! Op codes, close codes, the message envelope and typed payloads.

mod close_codes;
mod messages;
mod opcodes;
mod payloads;

pub use close_codes::{invalidates_session, is_fatal_code, CloseCode};
pub use messages::GatewayMessage;
pub use opcodes::OpCode;
pub use payloads::{
    HelloPayload, IdentifyPayload, IdentifyProperties, PresenceUpdatePayload, ReadyPayload,
    RequestGuildMembersPayload, ResumePayload, DEFAULT_LARGE_THRESHOLD,
};
