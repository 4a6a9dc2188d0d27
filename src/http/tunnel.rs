//! Tunnel endpoint: identify handshake and the server-side channel pump.
//!
//! # Data Flow
//! ```text
//! client ──ws── Text(token) ──→ identify ──→ ConnectionRegistry::register
//!
//! relay handler ──Frame──→ Channel outbound queue ──→ writer ──Binary──→ client
//! client ──Binary──→ reader ──→ PendingRequests (head / chunk / end / abort)
//! ```
//!
//! # Design Decisions
//! - A socket that does not identify within the grace period is dropped
//!   without ever touching the registry
//! - Identifying again with a token already bound closes the older channel,
//!   failing its pending requests
//! - When the socket ends, the binding is released only if it still points
//!   at this channel

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::broker::{Channel, RelayError};
use crate::http::server::AppState;
use crate::net::redact_token;
use crate::protocol::{decode_binary, decode_text, encode, Frame, WireMessage};

/// Axum handler for the tunnel upgrade path.
pub async fn tunnel_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_tunnel(socket, state))
}

async fn handle_tunnel(mut socket: WebSocket, state: AppState) {
    let Some(token) = identify(&mut socket, state.settings.identify_timeout).await else {
        tracing::debug!("Tunnel socket did not identify, dropping");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (channel, outbound) = Channel::new(token.clone(), state.settings.relay_timeout);
    if let Some(previous) = state.registry.register(token.clone(), Arc::clone(&channel)) {
        tracing::info!(
            token = %redact_token(&token),
            previous = %previous.id(),
            current = %channel.id(),
            "Token re-identified, closing previous channel"
        );
        previous.close();
    }

    pump(socket, &channel, outbound).await;

    channel.close();
    state.registry.release(&token, channel.id());
}

/// Wait for the identify message.
///
/// Returns `None` if the grace period lapses, the socket closes, or the
/// first data message is not a valid identify frame.
async fn identify(socket: &mut WebSocket, grace: Duration) -> Option<String> {
    let first_frame = async {
        while let Some(msg) = socket.recv().await {
            match msg {
                Ok(Message::Text(text)) => return decode_text(text.as_str()).ok(),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                _ => return None,
            }
        }
        None
    };
    match tokio::time::timeout(grace, first_frame).await {
        Ok(Some(Frame::Identify(token))) => Some(token),
        _ => None,
    }
}

/// Shuttle frames between the socket and the channel until either side ends.
async fn pump(socket: WebSocket, channel: &Channel, mut outbound: mpsc::Receiver<Frame>) {
    let (mut sink, mut stream) = socket.split();

    let writer = async {
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let msg = match encode(&frame) {
                        Ok(WireMessage::Binary(data)) => Message::Binary(data),
                        Ok(WireMessage::Text(text)) => Message::Text(text.into()),
                        Err(e) => {
                            tracing::warn!(channel_id = %channel.id(), error = %e, "Dropping unencodable frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(msg).await {
                        tracing::debug!(channel_id = %channel.id(), error = %e, "Tunnel write failed");
                        break;
                    }
                }
                _ = channel.closed() => break,
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    };

    let reader = async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => on_frame(channel, data).await,
                Ok(Message::Text(_)) => {
                    tracing::warn!(channel_id = %channel.id(), "Ignoring text message after identify")
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(channel_id = %channel.id(), error = %e, "Tunnel read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
}

/// Route one inbound frame to the request it belongs to.
///
/// Body chunks wait for room in the caller's queue, which holds back the
/// whole tunnel until the slow caller catches up or times out.
async fn on_frame(channel: &Channel, data: Bytes) {
    let pending = channel.pending();
    match decode_binary(data) {
        Ok(Frame::ResponseHead { id, head }) => {
            pending.resolve_head(id, head);
        }
        Ok(Frame::Chunk { id, data }) => {
            pending.push_chunk(id, data).await;
        }
        Ok(Frame::End { id }) => {
            pending.finish(id);
        }
        Ok(Frame::Abort { id, reason }) => {
            pending.fail(id, RelayError::LocalDispatch(reason));
        }
        Ok(other) => {
            tracing::warn!(channel_id = %channel.id(), frame = ?other.id(), "Unexpected frame from client");
        }
        Err(e) => {
            tracing::warn!(channel_id = %channel.id(), error = %e, "Undecodable frame from client");
        }
    }
}
