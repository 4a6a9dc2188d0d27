//! Tunnel channel protocol.
//!
//! # Data Flow
//! ```text
//! Server                                   Client
//!   ◀── Text(token) ─────────────────────── Identify
//!   ─── RequestHead ─ Chunk* ─ End ───────▶ reassemble, filter, dispatch
//!   ◀── ResponseHead ─ Chunk* ─ End ─────── stream origin reply
//!   ◀── Abort ───────────────────────────── dispatch failed mid-stream
//! ```
//!
//! # Design Decisions
//! - Identify is the only text frame; everything after it is binary
//! - Every binary frame carries its correlation id, so interleaved
//!   requests on one channel never need ordering across ids
//! - Body bytes travel untouched in Chunk frames (no re-encoding)

pub mod codec;
pub mod message;

pub use codec::{decode_binary, decode_text, encode, ProtocolError, ProtocolResult, WireMessage};
pub use message::{CorrelationId, Frame, HeaderList, RequestHead, ResponseHead, MAX_CHUNK_SIZE};
