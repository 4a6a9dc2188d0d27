//! Pending relay requests on one channel.
//!
//! Routes response frames arriving on a tunnel back to the HTTP handler
//! that is waiting for them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::error::{RelayError, RelayResult};
use crate::protocol::{CorrelationId, Frame, ResponseHead};

/// Response chunks buffered per request before the tunnel reader waits.
pub const BODY_QUEUE_CHUNKS: usize = 16;

/// One slice of a relayed response body.
pub type BodyChunk = Result<Bytes, RelayError>;

struct PendingEntry {
    head_tx: Option<oneshot::Sender<RelayResult<ResponseHead>>>,
    body_tx: mpsc::Sender<Bytes>,
    failure_tx: oneshot::Sender<RelayError>,
    timeout: Duration,
}

impl PendingEntry {
    /// Hand `err` to the caller, before or during the body.
    fn notify(self, err: RelayError) -> bool {
        match self.head_tx {
            Some(tx) => tx.send(Err(err)).is_ok(),
            // body_tx drops after the failure is in place
            None => self.failure_tx.send(err).is_ok(),
        }
    }
}

/// Tracks requests awaiting a response, keyed by correlation id.
#[derive(Clone, Default)]
pub struct PendingRequests {
    requests: Arc<DashMap<CorrelationId, PendingEntry>>,
    /// Outbound queue of the owning channel, used to abort work on the client.
    client: Option<mpsc::Sender<Frame>>,
}

/// Where a body chunk for an id goes.
enum Route {
    Unknown,
    BeforeHead,
    Body(mpsc::Sender<Bytes>, Duration),
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending map that sends `Abort` on `outbound` whenever the broker
    /// gives up on a request the client may still be working on.
    pub fn with_client(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            requests: Arc::default(),
            client: Some(outbound),
        }
    }

    /// Register a new pending request.
    ///
    /// `timeout` bounds the wait for the response head and every later gap
    /// between body chunks. Returns `None` if `id` is already pending.
    pub fn register(&self, id: CorrelationId, timeout: Duration) -> Option<PendingResponse> {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_QUEUE_CHUNKS);
        let (failure_tx, failure_rx) = oneshot::channel();

        match self.requests.entry(id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    head_tx: Some(head_tx),
                    body_tx,
                    failure_tx,
                    timeout,
                });
            }
        }
        debug!(request_id = %id, "Registered pending request");

        Some(PendingResponse {
            id,
            timeout,
            deadline: Instant::now() + timeout,
            head_rx,
            body: ResponseBody {
                id,
                rx: body_rx,
                failure: failure_rx,
                idle: timeout,
                finished: false,
                pending: self.clone(),
            },
        })
    }

    /// Deliver the response head for `id`.
    pub fn resolve_head(&self, id: CorrelationId, head: ResponseHead) -> bool {
        let head_tx = match self.requests.get_mut(&id) {
            Some(mut entry) => entry.head_tx.take(),
            None => {
                debug!(request_id = %id, "Discarding response for unknown request");
                return false;
            }
        };

        match head_tx {
            Some(tx) => {
                if tx.send(Ok(head)).is_err() {
                    debug!(request_id = %id, "Caller gone before response head");
                    self.cancel(id, "caller gone");
                    return false;
                }
                true
            }
            None => {
                warn!(request_id = %id, "Duplicate response head");
                self.abort(id, RelayError::Protocol("duplicate response head".into()));
                false
            }
        }
    }

    /// Deliver a body chunk for `id`.
    ///
    /// Waits while the caller's queue is full. A caller that drains nothing
    /// for a whole timeout period fails with [`RelayError::Timeout`] and the
    /// client is told to stop.
    pub async fn push_chunk(&self, id: CorrelationId, data: Bytes) -> bool {
        let route = match self.requests.get(&id) {
            None => Route::Unknown,
            Some(entry) if entry.head_tx.is_some() => Route::BeforeHead,
            Some(entry) => Route::Body(entry.body_tx.clone(), entry.timeout),
        };

        let (tx, timeout) = match route {
            Route::Unknown => return false,
            Route::BeforeHead => {
                self.abort(id, RelayError::Protocol("body chunk before response head".into()));
                return false;
            }
            Route::Body(tx, timeout) => (tx, timeout),
        };

        match tokio::time::timeout(timeout, tx.send(data)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!(request_id = %id, "Caller gone, dropping response body");
                self.cancel(id, "caller gone");
                false
            }
            Err(_) => {
                warn!(request_id = %id, "Caller stopped reading the response body");
                self.abort(id, RelayError::Timeout(timeout));
                false
            }
        }
    }

    /// The response for `id` is complete.
    pub fn finish(&self, id: CorrelationId) -> bool {
        match self.requests.remove(&id) {
            Some((_, entry)) => match entry.head_tx {
                Some(tx) => {
                    let _ = tx.send(Err(RelayError::Protocol("response ended before head".into())));
                    false
                }
                // dropping body_tx ends the caller's body stream
                None => true,
            },
            None => false,
        }
    }

    /// Fail `id` with `err`, before or during its body.
    pub fn fail(&self, id: CorrelationId, err: RelayError) -> bool {
        let Some((_, entry)) = self.requests.remove(&id) else {
            return false;
        };
        debug!(request_id = %id, error = %err, "Failing pending request");
        entry.notify(err)
    }

    /// Fail `id` with `err` and tell the client to stop working on it.
    pub fn abort(&self, id: CorrelationId, err: RelayError) -> bool {
        let Some((_, entry)) = self.requests.remove(&id) else {
            return false;
        };
        debug!(request_id = %id, error = %err, "Aborting pending request");
        self.notify_client(id, err.to_string());
        entry.notify(err)
    }

    /// Fail every pending request. Returns how many were pending.
    pub fn fail_all(&self, err: RelayError) -> usize {
        let ids: Vec<CorrelationId> = self.requests.iter().map(|r| *r.key()).collect();
        for id in &ids {
            self.fail(*id, err.clone());
        }
        ids.len()
    }

    /// Drop `id` whose caller has already given up, and tell the client.
    pub fn cancel(&self, id: CorrelationId, reason: impl Into<String>) {
        if self.requests.remove(&id).is_some() {
            let reason = reason.into();
            debug!(request_id = %id, reason = %reason, "Cancelled pending request");
            self.notify_client(id, reason);
        }
    }

    fn notify_client(&self, id: CorrelationId, reason: String) {
        let Some(client) = &self.client else {
            return;
        };
        // best effort: a full or closed queue means the tunnel is in trouble anyway
        if client.try_send(Frame::Abort { id, reason }).is_err() {
            debug!(request_id = %id, "Could not queue abort for client");
        }
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

/// Caller side of a pending request.
pub struct PendingResponse {
    id: CorrelationId,
    timeout: Duration,
    deadline: Instant,
    head_rx: oneshot::Receiver<RelayResult<ResponseHead>>,
    body: ResponseBody,
}

impl PendingResponse {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the response head until the deadline.
    ///
    /// On timeout the request is released, the client is told to abort it
    /// and late frames for it are discarded.
    pub async fn head(&mut self) -> RelayResult<ResponseHead> {
        match tokio::time::timeout_at(self.deadline, &mut self.head_rx).await {
            Ok(Ok(result)) => result,
            // sender dropped without a verdict: entry was cancelled under us
            Ok(Err(_)) => Err(RelayError::ChannelLost),
            Err(_) => {
                let err = RelayError::Timeout(self.timeout);
                self.body.pending.cancel(self.id, err.to_string());
                Err(err)
            }
        }
    }

    /// Body stream of the response. Call after [`head`](Self::head) succeeded.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }
}

/// Streaming body of a relayed response.
///
/// Dropping it (for example because the caller disconnected) releases the
/// pending entry and aborts the request on the client.
pub struct ResponseBody {
    id: CorrelationId,
    rx: mpsc::Receiver<Bytes>,
    failure: oneshot::Receiver<RelayError>,
    idle: Duration,
    finished: bool,
    pending: PendingRequests,
}

impl ResponseBody {
    /// Next chunk, `None` once the response is complete.
    ///
    /// A gap longer than the request timeout between chunks fails the body
    /// with [`RelayError::Timeout`].
    pub async fn next_chunk(&mut self) -> Option<BodyChunk> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout(self.idle, self.rx.recv()).await {
            Ok(Some(data)) => Some(Ok(data)),
            Ok(None) => {
                self.finished = true;
                self.failure.try_recv().ok().map(Err)
            }
            Err(_) => {
                self.finished = true;
                let err = RelayError::Timeout(self.idle);
                self.pending.cancel(self.id, "response body stalled");
                Some(Err(err))
            }
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.pending.cancel(self.id, "caller gone");
    }
}
