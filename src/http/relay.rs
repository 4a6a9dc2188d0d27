//! Relaying inbound HTTP requests through a tunnel.
//!
//! # Pipeline
//! ```text
//! Request
//!     → authenticate   (token header → live channel, else 401 empty)
//!     → strip_prefix   (/broker/echo?x=1 → /echo?x=1)
//!     → build_head     (scrubbed headers, streaming flag)
//!     → screen         (optional server ruleset, else 401 "blocked")
//!     → forward        (RequestHead, Chunk*, End under a fresh id)
//!     → await_response (head before deadline, then streamed body with an
//!                       idle deadline between chunks)
//! ```
//! Every stage returns `RelayResult`; an `Err` short-circuits into the
//! matching HTTP response.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{request::Parts, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt;

use crate::broker::{Channel, PendingResponse, RelayError, RelayResult};
use crate::filters::Verdict;
use crate::http::server::AppState;
use crate::net::redact_token;
use crate::observability::metrics;
use crate::protocol::{CorrelationId, Frame, RequestHead, MAX_CHUNK_SIZE};
use crate::security::{response_header_map, scrub_request_headers};

/// Axum handler for everything under the routing prefix.
pub async fn relay_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    match relay(&state, request).await {
        Ok(response) => {
            metrics::record_relay(&method, "relayed", start);
            tracing::debug!(method = %method, path = %path, status = %response.status(), "Relayed request");
            response
        }
        Err(err) => {
            metrics::record_relay(&method, err.outcome(), start);
            match err {
                RelayError::Unauthorized | RelayError::FilterDenied => {
                    tracing::debug!(method = %method, path = %path, error = %err, "Relay refused")
                }
                _ => tracing::warn!(method = %method, path = %path, error = %err, "Relay failed"),
            }
            err.into_response()
        }
    }
}

async fn relay(state: &AppState, request: Request<Body>) -> RelayResult<Response> {
    let (parts, body) = request.into_parts();

    let channel = authenticate(state, &parts.headers)?;
    let url = strip_prefix(&parts, &state.settings.routing_prefix)?;
    let head = build_head(&parts, url, state.settings.auth_header.as_str());

    let body = match &state.filters {
        Some(_) => {
            let bytes = buffer_body(body, state.settings.max_body_size).await?;
            screen(state, &head, &bytes)?;
            OutboundBody::Buffered(bytes)
        }
        None => OutboundBody::Streaming(body),
    };

    let pending = forward(&channel, head, body, state.settings.max_body_size).await?;
    await_response(pending).await
}

/// Resolve the caller's token to a live channel.
fn authenticate(state: &AppState, headers: &HeaderMap) -> RelayResult<Arc<Channel>> {
    let token = headers
        .get(&state.settings.auth_header)
        .and_then(|v| v.to_str().ok())
        .ok_or(RelayError::Unauthorized)?;

    state.registry.get(token).ok_or_else(|| {
        tracing::debug!(token = %redact_token(token), "No tunnel registered for token");
        RelayError::Unauthorized
    })
}

/// Path and query after the routing prefix, query string untouched.
fn strip_prefix(parts: &Parts, prefix: &str) -> RelayResult<String> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let rest = path_and_query
        .strip_prefix(prefix)
        .ok_or_else(|| RelayError::Protocol(format!("path outside routing prefix {prefix}")))?;

    if rest.is_empty() || rest.starts_with('?') {
        Ok(format!("/{rest}"))
    } else if rest.starts_with('/') {
        Ok(rest.to_string())
    } else {
        Err(RelayError::Protocol(format!("path outside routing prefix {prefix}")))
    }
}

fn build_head(parts: &Parts, url: String, auth_header: &str) -> RequestHead {
    RequestHead {
        method: parts.method.to_string(),
        url,
        headers: scrub_request_headers(&parts.headers, auth_header),
        streaming: !parts.headers.contains_key(axum::http::header::CONTENT_LENGTH),
    }
}

/// Apply the server-side ruleset, if one is configured.
fn screen(state: &AppState, head: &RequestHead, body: &[u8]) -> RelayResult<()> {
    let Some(filters) = &state.filters else {
        return Ok(());
    };
    match filters.evaluate(&head.method, head.path(), body) {
        Verdict::Allow { .. } => Ok(()),
        Verdict::Deny => {
            metrics::record_filter_denial("server");
            Err(RelayError::FilterDenied)
        }
    }
}

enum OutboundBody {
    Buffered(Bytes),
    Streaming(Body),
}

async fn buffer_body(body: Body, limit: usize) -> RelayResult<Bytes> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| RelayError::PayloadTooLarge(limit))
}

/// Send the request over the channel and register it as pending.
async fn forward(channel: &Channel, head: RequestHead, body: OutboundBody, limit: usize) -> RelayResult<PendingResponse> {
    let pending = channel.open_request()?;
    let id = pending.id();
    tracing::trace!(request_id = %id, channel_id = %channel.id(), url = %head.url, "Forwarding request");

    channel.send(Frame::RequestHead { id, head }).await?;

    let sent = match body {
        OutboundBody::Buffered(bytes) => send_bytes(channel, id, bytes).await,
        OutboundBody::Streaming(body) => send_stream(channel, id, body, limit).await,
    };
    if let Err(err) = sent {
        channel.pending().cancel(id, err.to_string());
        return Err(err);
    }

    channel.send(Frame::End { id }).await?;
    Ok(pending)
}

async fn send_bytes(channel: &Channel, id: CorrelationId, mut bytes: Bytes) -> RelayResult<()> {
    while !bytes.is_empty() {
        let data = bytes.split_to(bytes.len().min(MAX_CHUNK_SIZE));
        channel.send(Frame::Chunk { id, data }).await?;
    }
    Ok(())
}

async fn send_stream(channel: &Channel, id: CorrelationId, body: Body, limit: usize) -> RelayResult<()> {
    let mut stream = body.into_data_stream();
    let mut total = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RelayError::Protocol(format!("request body: {e}")))?;
        total += chunk.len();
        if total > limit {
            return Err(RelayError::PayloadTooLarge(limit));
        }
        send_bytes(channel, id, chunk).await?;
    }
    Ok(())
}

/// Wait for the response head, then stream the body back to the caller.
async fn await_response(mut pending: PendingResponse) -> RelayResult<Response> {
    let head = pending.head().await?;
    let status = StatusCode::from_u16(head.status)
        .map_err(|_| RelayError::Protocol(format!("invalid status {}", head.status)))?;

    let body = pending.into_body();
    let stream = futures_util::stream::unfold(body, |mut body| async move {
        body.next_chunk().await.map(|chunk| (chunk, body))
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = response_header_map(&head.headers);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_strip_prefix_keeps_query() {
        let p = parts("http://broker/broker/echo-query?shape=square&colour=yellow");
        assert_eq!(strip_prefix(&p, "/broker").unwrap(), "/echo-query?shape=square&colour=yellow");
    }

    #[test]
    fn test_strip_prefix_edges() {
        assert_eq!(strip_prefix(&parts("/broker"), "/broker").unwrap(), "/");
        assert_eq!(strip_prefix(&parts("/broker?a=1"), "/broker").unwrap(), "/?a=1");
        assert_eq!(strip_prefix(&parts("/broker/"), "/broker").unwrap(), "/");
        assert!(strip_prefix(&parts("/brokerage/x"), "/broker").is_err());
    }

    #[test]
    fn test_build_head_scrubs_and_flags_streaming() {
        let request = Request::builder()
            .method("POST")
            .uri("/broker/echo-body")
            .header("X-Broker-Authorization", "12345")
            .header("content-type", "application/json")
            .body(())
            .unwrap();
        let (p, _) = request.into_parts();
        let head = build_head(&p, "/echo-body".into(), "x-broker-authorization");
        assert_eq!(head.method, "POST");
        assert!(head.streaming);
        assert_eq!(head.headers, vec![("content-type".to_string(), "application/json".to_string())]);
    }

    #[tokio::test]
    async fn test_forward_frames_in_order() {
        let (channel, mut rx) = Channel::new("12345", std::time::Duration::from_secs(5));
        let head = RequestHead {
            method: "POST".into(),
            url: "/echo-body".into(),
            headers: vec![],
            streaming: false,
        };
        let body = OutboundBody::Buffered(Bytes::from(vec![7u8; MAX_CHUNK_SIZE + 10]));
        let pending = forward(&channel, head.clone(), body, usize::MAX).await.unwrap();
        let id = pending.id();

        assert_eq!(rx.recv().await, Some(Frame::RequestHead { id, head }));
        match rx.recv().await {
            Some(Frame::Chunk { data, .. }) => assert_eq!(data.len(), MAX_CHUNK_SIZE),
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await {
            Some(Frame::Chunk { data, .. }) => assert_eq!(data.len(), 10),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(Frame::End { id }));
    }

    #[tokio::test]
    async fn test_oversized_stream_aborts() {
        let (channel, mut rx) = Channel::new("12345", std::time::Duration::from_secs(5));
        let head = RequestHead {
            method: "POST".into(),
            url: "/".into(),
            headers: vec![],
            streaming: true,
        };
        let body = OutboundBody::Streaming(Body::from(vec![1u8; 100]));
        let err = forward(&channel, head, body, 10).await.err().unwrap();
        assert_eq!(err, RelayError::PayloadTooLarge(10));

        assert!(matches!(rx.recv().await, Some(Frame::RequestHead { .. })));
        assert!(matches!(rx.recv().await, Some(Frame::Abort { .. })));
        // the failed request is no longer pending
        assert_eq!(channel.pending().count(), 0);
    }

    #[tokio::test]
    async fn test_caller_leaving_aborts_client_work() {
        let (channel, mut rx) = Channel::new("12345", std::time::Duration::from_secs(5));
        let head = RequestHead {
            method: "GET".into(),
            url: "/slow".into(),
            headers: vec![],
            streaming: false,
        };
        let pending = forward(&channel, head, OutboundBody::Buffered(Bytes::new()), usize::MAX)
            .await
            .unwrap();
        let id = pending.id();
        assert!(matches!(rx.recv().await, Some(Frame::RequestHead { .. })));
        assert_eq!(rx.recv().await, Some(Frame::End { id }));

        drop(pending);
        assert!(matches!(rx.recv().await, Some(Frame::Abort { id: aborted, .. }) if aborted == id));
        assert_eq!(channel.pending().count(), 0);
    }
}
