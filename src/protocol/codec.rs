//! Binary framing of tunnel messages.
//!
//! Frame format: `[1-byte kind][16-byte correlation id][payload]`
//!
//! Frame kinds:
//! - `0x01`: request head (payload: JSON)
//! - `0x02`: response head (payload: JSON)
//! - `0x03`: body chunk (payload: raw bytes)
//! - `0x04`: end of body (no payload)
//! - `0x05`: abort (payload: UTF-8 reason)
//!
//! Identify is not framed: it travels as a plain text message.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::message::{CorrelationId, Frame};

const FRAME_REQUEST_HEAD: u8 = 0x01;
const FRAME_RESPONSE_HEAD: u8 = 0x02;
const FRAME_CHUNK: u8 = 0x03;
const FRAME_END: u8 = 0x04;
const FRAME_ABORT: u8 = 0x05;

const HEADER_LEN: usize = 1 + 16;

/// Errors raised while decoding channel messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),

    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("malformed frame head: {0}")]
    MalformedHead(#[from] serde_json::Error),

    #[error("abort reason is not valid UTF-8")]
    InvalidReason,

    #[error("identify carries an empty token")]
    EmptyToken,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Transport-neutral encoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

/// Encode a frame for the wire.
pub fn encode(frame: &Frame) -> ProtocolResult<WireMessage> {
    let encoded = match frame {
        Frame::Identify(token) => return Ok(WireMessage::Text(token.clone())),
        Frame::RequestHead { id, head } => build(FRAME_REQUEST_HEAD, id, &serde_json::to_vec(head)?),
        Frame::ResponseHead { id, head } => build(FRAME_RESPONSE_HEAD, id, &serde_json::to_vec(head)?),
        Frame::Chunk { id, data } => build(FRAME_CHUNK, id, data),
        Frame::End { id } => build(FRAME_END, id, &[]),
        Frame::Abort { id, reason } => build(FRAME_ABORT, id, reason.as_bytes()),
    };
    Ok(WireMessage::Binary(encoded))
}

fn build(kind: u8, id: &CorrelationId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind);
    buf.put_slice(id.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a binary frame.
pub fn decode_binary(data: Bytes) -> ProtocolResult<Frame> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::ShortFrame(data.len()));
    }
    let kind = data[0];
    let mut raw_id = [0u8; 16];
    raw_id.copy_from_slice(&data[1..HEADER_LEN]);
    let id = Uuid::from_bytes(raw_id);
    let payload = data.slice(HEADER_LEN..);

    let frame = match kind {
        FRAME_REQUEST_HEAD => Frame::RequestHead {
            id,
            head: serde_json::from_slice(&payload)?,
        },
        FRAME_RESPONSE_HEAD => Frame::ResponseHead {
            id,
            head: serde_json::from_slice(&payload)?,
        },
        FRAME_CHUNK => Frame::Chunk { id, data: payload },
        FRAME_END => Frame::End { id },
        FRAME_ABORT => Frame::Abort {
            id,
            reason: String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidReason)?,
        },
        other => return Err(ProtocolError::UnknownKind(other)),
    };
    Ok(frame)
}

/// Decode a text message. Text is only ever an identify message.
pub fn decode_text(text: &str) -> ProtocolResult<Frame> {
    if text.is_empty() {
        return Err(ProtocolError::EmptyToken);
    }
    Ok(Frame::Identify(text.to_string()))
}
