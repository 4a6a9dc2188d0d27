//! Reverse-tunnel HTTP broker.
//!
//! A public server accepts HTTP requests under a routing prefix and relays
//! them over a websocket tunnel opened by a client inside a private
//! network. The client screens each request against its whitelist, expands
//! `${NAME}` placeholders in marked body fields, calls the private service
//! and streams the answer back.

// Wire format and core state
pub mod broker;
pub mod protocol;

// Roles
pub mod client;
pub mod http;

// Request screening
pub mod filters;
pub mod payload;
pub mod substitution;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod security;

pub use broker::{ConnectionRegistry, RelayError};
pub use client::BrokerClient;
pub use config::BrokerConfig;
pub use http::BrokerServer;
pub use lifecycle::Shutdown;
