//! Network identity helpers.
//!
//! # Design Decisions
//! - Channel ids are process-local and never reused
//! - Tokens never appear in logs in full

pub mod connection;

pub use connection::{redact_token, ChannelId};
