//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request (server):
//!     → headers.rs (drop hop-by-hop and broker credentials)
//!     → RequestHead sent over the tunnel
//!
//! RequestHead (client):
//!     → headers.rs (rebuild HeaderMap for the private service)
//!
//! Private service response (client):
//!     → headers.rs (drop hop-by-hop, keep the rest in order)
//!
//! ResponseHead (server):
//!     → headers.rs (drop hop-by-hop before answering the caller)
//! ```
//!
//! # Design Decisions
//! - Fail closed: the broker credential is dropped under any spelling
//! - Headers named in `Connection` are treated as hop-by-hop too
//! - Header values that are not valid UTF-8 are dropped, not mangled

pub mod headers;

pub use headers::{
    forwardable_headers, response_header_list, response_header_map, scrub_request_headers, DEFAULT_AUTH_HEADER, LEGACY_TOKEN_HEADER,
};
