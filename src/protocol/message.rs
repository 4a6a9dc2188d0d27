//! Typed messages carried over a tunnel channel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier linking a relayed request to its response.
pub type CorrelationId = Uuid;

/// Largest body slice carried by a single chunk frame.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Ordered header list. Repeated header names appear as repeated entries.
pub type HeaderList = Vec<(String, String)>;

/// Request line and headers of a relayed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    /// Path and query with the routing prefix already stripped.
    pub url: String,
    pub headers: HeaderList,
    /// True when the caller did not announce a body length.
    #[serde(default)]
    pub streaming: bool,
}

impl RequestHead {
    /// Path component of `url` (everything before `?`).
    pub fn path(&self) -> &str {
        self.url.split_once('?').map(|(p, _)| p).unwrap_or(&self.url)
    }
}

/// Status and headers of a relayed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HeaderList,
}

impl ResponseHead {
    /// A response carrying no headers other than a plain-text content type.
    pub fn plain(status: u16) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "text/plain; charset=utf-8".to_string())],
        }
    }
}

/// A single message on a tunnel channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First message from the client: its token.
    Identify(String),
    RequestHead { id: CorrelationId, head: RequestHead },
    ResponseHead { id: CorrelationId, head: ResponseHead },
    /// A slice of body bytes for request or response `id`.
    Chunk { id: CorrelationId, data: Bytes },
    /// Body for `id` is complete.
    End { id: CorrelationId },
    /// The sender gave up on `id`; the correlation fails.
    Abort { id: CorrelationId, reason: String },
}

impl Frame {
    /// Correlation id of the frame, if it belongs to a relay exchange.
    pub fn id(&self) -> Option<CorrelationId> {
        match self {
            Frame::Identify(_) => None,
            Frame::RequestHead { id, .. }
            | Frame::ResponseHead { id, .. }
            | Frame::Chunk { id, .. }
            | Frame::End { id }
            | Frame::Abort { id, .. } => Some(*id),
        }
    }
}
