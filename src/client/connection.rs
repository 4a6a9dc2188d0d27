//! One tunnel session: dial, identify, pump frames, reassemble requests.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::broker::channel::OUTBOUND_CAPACITY;
use crate::client::dispatch::{Dispatcher, InboundRequest};
use crate::client::{ClientError, ClientResult};
use crate::net::redact_token;
use crate::protocol::{decode_binary, encode, CorrelationId, Frame, RequestHead, WireMessage};

pub type TunnelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The tunnel closed or failed; reconnect.
    Lost,
    /// Shutdown was requested; stop.
    Shutdown,
}

/// Websocket URL of the tunnel endpoint for `server_url`.
///
/// `http` maps to `ws` and `https` to `wss`; any path on `server_url` is
/// kept as a base for `tunnel_path`.
pub fn tunnel_url(server_url: &str, tunnel_path: &str) -> ClientResult<Url> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ClientError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Scheme(url.scheme().to_string()))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), tunnel_path);
    url.set_path(&path);
    Ok(url)
}

/// Open the tunnel and identify with `token`.
pub async fn connect(url: &Url, token: &str) -> ClientResult<TunnelStream> {
    let identify = to_message(encode(&Frame::Identify(token.to_string()))?);
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    ws.send(identify).await?;
    tracing::info!(url = %url, token = %redact_token(token), "Tunnel established");
    Ok(ws)
}

fn to_message(wire: WireMessage) -> Message {
    match wire {
        WireMessage::Binary(data) => Message::Binary(data),
        WireMessage::Text(text) => Message::Text(text.into()),
    }
}

/// A request whose body is still arriving.
struct Assembly {
    head: RequestHead,
    body: BytesMut,
}

/// Reassembles interleaved request frames into complete requests.
struct Reassembler {
    in_flight: HashMap<CorrelationId, Assembly>,
    max_body_size: usize,
}

/// What the session should do after one inbound frame.
#[derive(Debug, PartialEq)]
enum Step {
    Nothing,
    Dispatch(InboundRequest),
    Reject(CorrelationId, String),
    /// The server gave up on a request that is already dispatched.
    Cancel(CorrelationId, String),
}

impl Reassembler {
    fn new(max_body_size: usize) -> Self {
        Self {
            in_flight: HashMap::new(),
            max_body_size,
        }
    }

    fn accept(&mut self, frame: Frame) -> Step {
        match frame {
            Frame::RequestHead { id, head } => {
                let assembly = Assembly {
                    head,
                    body: BytesMut::new(),
                };
                if self.in_flight.insert(id, assembly).is_some() {
                    tracing::warn!(request_id = %id, "Request head repeated, restarting request");
                }
                Step::Nothing
            }
            Frame::Chunk { id, data } => {
                let Some(assembly) = self.in_flight.get_mut(&id) else {
                    tracing::debug!(request_id = %id, "Chunk for unknown request");
                    return Step::Nothing;
                };
                if assembly.body.len() + data.len() > self.max_body_size {
                    self.in_flight.remove(&id);
                    return Step::Reject(id, format!("request body exceeds {} bytes", self.max_body_size));
                }
                assembly.body.extend_from_slice(&data);
                Step::Nothing
            }
            Frame::End { id } => match self.in_flight.remove(&id) {
                Some(Assembly { head, body }) => Step::Dispatch(InboundRequest {
                    id,
                    head,
                    body: body.freeze(),
                }),
                None => Step::Nothing,
            },
            Frame::Abort { id, reason } => {
                if self.in_flight.remove(&id).is_some() {
                    tracing::debug!(request_id = %id, reason = %reason, "Request aborted by server");
                    return Step::Nothing;
                }
                Step::Cancel(id, reason)
            }
            other => {
                tracing::warn!(frame = ?other.id(), "Unexpected frame from server");
                Step::Nothing
            }
        }
    }
}

/// Pump frames until the tunnel ends or shutdown fires.
pub async fn serve(
    ws: TunnelStream,
    dispatcher: &Dispatcher,
    max_body_size: usize,
    shutdown: &mut broadcast::Receiver<()>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
    let mut reassembler = Reassembler::new(max_body_size);
    // dispatches still running, each with the switch that cancels it
    let running: Arc<DashMap<CorrelationId, oneshot::Sender<()>>> = Arc::new(DashMap::new());

    let writer = async {
        while let Some(frame) = out_rx.recv().await {
            let msg = match encode(&frame) {
                Ok(wire) => to_message(wire),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(msg).await {
                tracing::debug!(error = %e, "Tunnel write failed");
                return;
            }
        }
    };

    let reader = async {
        while let Some(msg) = stream.next().await {
            let data: Bytes = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => return,
                Ok(Message::Text(_)) => {
                    tracing::warn!("Ignoring text message from server");
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Tunnel read failed");
                    return;
                }
            };
            let frame = match decode_binary(data) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "Undecodable frame from server");
                    continue;
                }
            };
            match reassembler.accept(frame) {
                Step::Nothing => {}
                Step::Dispatch(request) => {
                    let id = request.id;
                    let (cancel_tx, cancel_rx) = oneshot::channel();
                    running.insert(id, cancel_tx);

                    let dispatcher = dispatcher.clone();
                    let out = out_tx.clone();
                    let running = Arc::clone(&running);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = dispatcher.dispatch(request, out) => {}
                            _ = cancel_rx => {}
                        }
                        running.remove(&id);
                    });
                }
                Step::Cancel(id, reason) => {
                    if let Some((_, cancel)) = running.remove(&id) {
                        tracing::debug!(request_id = %id, reason = %reason, "Cancelling dispatch");
                        let _ = cancel.send(());
                    }
                }
                Step::Reject(id, reason) => {
                    tracing::warn!(request_id = %id, reason = %reason, "Rejecting request");
                    if out_tx.send(Frame::Abort { id, reason }).await.is_err() {
                        return;
                    }
                }
            }
        }
    };

    let end = tokio::select! {
        _ = writer => SessionEnd::Lost,
        _ = reader => SessionEnd::Lost,
        _ = shutdown.recv() => SessionEnd::Shutdown,
    };
    let _ = sink.send(Message::Close(None)).await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_tunnel_url() {
        assert_eq!(
            tunnel_url("http://localhost:7341", "/tunnel").unwrap().as_str(),
            "ws://localhost:7341/tunnel"
        );
        assert_eq!(
            tunnel_url("https://broker.example/base/", "/tunnel").unwrap().as_str(),
            "wss://broker.example/base/tunnel"
        );
        assert!(matches!(tunnel_url("ftp://x", "/tunnel"), Err(ClientError::Scheme(_))));
        assert!(matches!(tunnel_url("not a url", "/tunnel"), Err(ClientError::Url(_))));
    }

    fn head(url: &str) -> RequestHead {
        RequestHead {
            method: "POST".into(),
            url: url.into(),
            headers: vec![],
            streaming: false,
        }
    }

    #[test]
    fn test_reassembles_interleaved_requests() {
        let mut r = Reassembler::new(1024);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(r.accept(Frame::RequestHead { id: a, head: head("/a") }), Step::Nothing);
        assert_eq!(r.accept(Frame::RequestHead { id: b, head: head("/b") }), Step::Nothing);
        r.accept(Frame::Chunk { id: a, data: Bytes::from_static(b"he") });
        r.accept(Frame::Chunk { id: b, data: Bytes::from_static(b"other") });
        r.accept(Frame::Chunk { id: a, data: Bytes::from_static(b"llo") });

        match r.accept(Frame::End { id: a }) {
            Step::Dispatch(req) => {
                assert_eq!(req.head.url, "/a");
                assert_eq!(req.body, Bytes::from_static(b"hello"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(r.accept(Frame::End { id: b }), Step::Dispatch(req) if req.body == "other"));
        assert!(r.in_flight.is_empty());
    }

    #[test]
    fn test_abort_and_oversize() {
        let mut r = Reassembler::new(4);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        r.accept(Frame::RequestHead { id: a, head: head("/a") });
        r.accept(Frame::Abort { id: a, reason: "caller left".into() });
        assert_eq!(r.accept(Frame::End { id: a }), Step::Nothing);

        r.accept(Frame::RequestHead { id: b, head: head("/b") });
        assert!(matches!(
            r.accept(Frame::Chunk { id: b, data: Bytes::from_static(b"too long") }),
            Step::Reject(id, _) if id == b
        ));
        assert_eq!(r.accept(Frame::End { id: b }), Step::Nothing);
    }

    #[test]
    fn test_abort_for_dispatched_request_cancels() {
        let mut r = Reassembler::new(1024);
        let id = Uuid::new_v4();
        r.accept(Frame::RequestHead { id, head: head("/slow") });
        assert!(matches!(r.accept(Frame::End { id }), Step::Dispatch(_)));

        assert_eq!(
            r.accept(Frame::Abort { id, reason: "no response within 30s".into() }),
            Step::Cancel(id, "no response within 30s".into())
        );
    }

    #[test]
    fn test_identify_is_a_text_message() {
        let msg = to_message(encode(&Frame::Identify("12345".into())).unwrap());
        assert_eq!(msg, Message::Text("12345".into()));
    }
}
