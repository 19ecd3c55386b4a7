//! Integration test utilities for the client
//!
//! This crate provides a fake gateway server and an in-memory REST transport
//! for end-to-end tests of sessions, sharding and rate limiting.

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
