//! Client side of a relayed request: filter, substitute, forward, reply.
//!
//! Every request that reaches [`Dispatcher::dispatch`] gets exactly one
//! terminal frame back (End or Abort), whatever happens locally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;

use crate::broker::error::BLOCKED_BODY;
use crate::config::ClientConfig;
use crate::filters::{Ruleset, Verdict};
use crate::observability::metrics;
use crate::protocol::{CorrelationId, Frame, RequestHead, ResponseHead, MAX_CHUNK_SIZE};
use crate::security::{forwardable_headers, response_header_list};
use crate::substitution::{self, ProcessEnv, VariableSource};

/// Shared, hot-swappable client ruleset.
pub type SharedRuleset = Arc<ArcSwap<Ruleset>>;

/// A fully reassembled request received over the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub id: CorrelationId,
    pub head: RequestHead,
    pub body: Bytes,
}

/// Variables visible to substitution on the client.
///
/// The process environment wins; `BROKER_TOKEN` and `BROKER_TYPE` fall back
/// to the running client's token and `client`.
#[derive(Debug, Clone)]
pub struct ClientVariables {
    defaults: HashMap<String, String>,
}

impl ClientVariables {
    pub fn new(token: &str) -> Self {
        let defaults = HashMap::from([
            ("BROKER_TOKEN".to_string(), token.to_string()),
            ("BROKER_TYPE".to_string(), "client".to_string()),
        ]);
        Self { defaults }
    }
}

impl VariableSource for ClientVariables {
    fn lookup(&self, name: &str) -> Option<String> {
        ProcessEnv.lookup(name).or_else(|| self.defaults.get(name).cloned())
    }
}

/// Why a request could not be handed to the private service.
#[derive(Debug)]
struct DispatchFailure {
    status: StatusCode,
    reason: String,
}

/// Runs relayed requests against the private service.
#[derive(Clone)]
pub struct Dispatcher {
    http: Client<HttpConnector, Body>,
    filters: SharedRuleset,
    origin: String,
    marker: String,
    timeout: Duration,
    vars: Arc<dyn VariableSource + Send + Sync>,
}

impl Dispatcher {
    pub fn new(config: &ClientConfig, filters: SharedRuleset, vars: Arc<dyn VariableSource + Send + Sync>) -> Self {
        Self {
            http: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            filters,
            origin: config.origin.clone(),
            marker: config.substitution_marker.clone(),
            timeout: Duration::from_secs(config.dispatch_timeout_secs),
            vars,
        }
    }

    /// Handle one request and send its reply frames to `out`.
    pub async fn dispatch(&self, request: InboundRequest, out: mpsc::Sender<Frame>) {
        let InboundRequest { id, head, body } = request;
        let start = Instant::now();

        let Some(origin) = self.screen(&head, &body) else {
            tracing::info!(request_id = %id, method = %head.method, path = %head.path(), "Request blocked by filter");
            metrics::record_filter_denial("client");
            reply(&out, id, ResponseHead::plain(401), Bytes::from_static(BLOCKED_BODY.as_bytes())).await;
            return;
        };

        match self.forward(&origin, &head, body).await {
            Ok(response) => {
                tracing::debug!(
                    request_id = %id,
                    method = %head.method,
                    url = %head.url,
                    status = %response.status(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Private service answered"
                );
                stream_response(&out, id, response).await;
            }
            Err(failure) => {
                tracing::warn!(request_id = %id, url = %head.url, reason = %failure.reason, "Local dispatch failed");
                reply(
                    &out,
                    id,
                    ResponseHead::plain(failure.status.as_u16()),
                    Bytes::from(failure.reason),
                )
                .await;
            }
        }
    }

    /// The origin to dispatch to, or `None` when the ruleset denies.
    fn screen(&self, head: &RequestHead, body: &[u8]) -> Option<String> {
        let filters = self.filters.load();
        match filters.evaluate(&head.method, head.path(), body) {
            Verdict::Allow { rule, .. } => Some(match &rule.origin {
                Some(origin) => substitution::expand(origin, self.vars.as_ref()).into_owned(),
                None => self.origin.clone(),
            }),
            Verdict::Deny => None,
        }
    }

    async fn forward(&self, origin: &str, head: &RequestHead, body: Bytes) -> Result<Response<Incoming>, DispatchFailure> {
        let bad_request = |reason: String| DispatchFailure {
            status: StatusCode::BAD_GATEWAY,
            reason,
        };

        let body = substitution::substitute_body(&body, &self.marker, self.vars.as_ref())
            .map(Bytes::from)
            .unwrap_or(body);

        let uri = format!("{}{}", origin.trim_end_matches('/'), head.url);
        let method = Method::from_bytes(head.method.as_bytes()).map_err(|e| bad_request(e.to_string()))?;
        let mut request = Request::builder()
            .method(method)
            .uri(&uri)
            .body(Body::from(body))
            .map_err(|e| bad_request(format!("{uri}: {e}")))?;
        *request.headers_mut() = forwardable_headers(&head.headers);

        match tokio::time::timeout(self.timeout, self.http.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(bad_request(format!("{uri}: {e}"))),
            Err(_) => Err(DispatchFailure {
                status: StatusCode::GATEWAY_TIMEOUT,
                reason: format!("{uri}: no response within {:?}", self.timeout),
            }),
        }
    }
}

/// Send a complete, buffered reply.
async fn reply(out: &mpsc::Sender<Frame>, id: CorrelationId, head: ResponseHead, body: Bytes) {
    if out.send(Frame::ResponseHead { id, head }).await.is_err() {
        return;
    }
    if send_chunks(out, id, body).await {
        let _ = out.send(Frame::End { id }).await;
    }
}

/// Relay a private service response as it arrives.
async fn stream_response(out: &mpsc::Sender<Frame>, id: CorrelationId, response: Response<Incoming>) {
    let (parts, incoming) = response.into_parts();
    let head = ResponseHead {
        status: parts.status.as_u16(),
        headers: response_header_list(&parts.headers),
    };
    if out.send(Frame::ResponseHead { id, head }).await.is_err() {
        return;
    }

    let mut stream = Body::new(incoming).into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(data) => {
                if !send_chunks(out, id, data).await {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Private service body failed mid-stream");
                let _ = out
                    .send(Frame::Abort {
                        id,
                        reason: format!("response body: {e}"),
                    })
                    .await;
                return;
            }
        }
    }
    let _ = out.send(Frame::End { id }).await;
}

/// Returns false once the tunnel is gone.
async fn send_chunks(out: &mpsc::Sender<Frame>, id: CorrelationId, mut data: Bytes) -> bool {
    while !data.is_empty() {
        let piece = data.split_to(data.len().min(MAX_CHUNK_SIZE));
        if out.send(Frame::Chunk { id, data: piece }).await.is_err() {
            return false;
        }
    }
    true
}
