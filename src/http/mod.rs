//! Public HTTP boundary of the broker server.
//!
//! # Data Flow
//! ```text
//! GET {tunnel_path} (websocket)
//!     → tunnel.rs (identify, register, pump frames)
//!
//! ANY {routing_prefix}/...
//!     → relay.rs (authenticate, strip prefix, screen, forward, await)
//!     → response streamed back from the tunnel
//! ```

pub mod relay;
pub mod server;
pub mod tunnel;

pub use server::{AppState, BrokerServer, RelaySettings};
