//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Tunnel lost or dial failed (client):
//!     → backoff.rs (exponential delay with jitter)
//!     → dial again
//! ```
//!
//! Every other external call is bounded by a deadline where it is made:
//! pending relays on the server, private service calls on the client.

pub mod backoff;
