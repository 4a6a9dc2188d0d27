//! Connection broker core.
//!
//! # Data Flow
//! ```text
//! Identify(token) on a new tunnel
//!     → channel.rs (Channel: outbound queue + pending map + close signal)
//!     → registry.rs (token → Channel, replaces and closes any previous one)
//!
//! Relay on the server
//!     → registry.rs lookup by token
//!     → channel.rs open_request (fresh correlation id)
//!     → pending.rs (await head with deadline, then stream body)
//! ```
//!
//! # Design Decisions
//! - Registry and pending maps are the only shared mutable state
//! - Whoever removes a pending entry owns its completion
//! - Closing a channel fails every pending request on it

pub mod channel;
pub mod error;
pub mod pending;
pub mod registry;

pub use channel::Channel;
pub use error::{RelayError, RelayResult};
pub use pending::{PendingRequests, PendingResponse, ResponseBody};
pub use registry::ConnectionRegistry;
