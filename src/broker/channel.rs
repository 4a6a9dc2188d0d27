//! Server-side handle of one live tunnel channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::info;
use uuid::Uuid;

use crate::broker::error::{RelayError, RelayResult};
use crate::broker::pending::{PendingRequests, PendingResponse};
use crate::net::{redact_token, ChannelId};
use crate::protocol::Frame;

/// Frames queued towards the client before senders wait.
pub const OUTBOUND_CAPACITY: usize = 256;

/// A tunnel channel bound to one token.
///
/// The transport task owns the websocket; this handle owns everything the
/// HTTP side needs: the outbound queue, the pending map and the close signal.
pub struct Channel {
    id: ChannelId,
    token: String,
    established_at: Instant,
    relay_timeout: Duration,
    outbound: mpsc::Sender<Frame>,
    pending: PendingRequests,
    closed: watch::Sender<bool>,
}

impl Channel {
    /// Create a channel and the receiving end of its outbound queue.
    pub fn new(token: impl Into<String>, relay_timeout: Duration) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (closed, _) = watch::channel(false);
        let channel = Arc::new(Self {
            id: ChannelId::new(),
            token: token.into(),
            established_at: Instant::now(),
            relay_timeout,
            pending: PendingRequests::with_client(outbound.clone()),
            outbound,
            closed,
        });
        (channel, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Queue a frame towards the client.
    pub async fn send(&self, frame: Frame) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::ChannelLost);
        }
        self.outbound.send(frame).await.map_err(|_| RelayError::ChannelLost)
    }

    /// Start a relay exchange under a fresh correlation id.
    pub fn open_request(&self) -> RelayResult<PendingResponse> {
        if self.is_closed() {
            return Err(RelayError::ChannelLost);
        }
        loop {
            if let Some(response) = self.pending.register(Uuid::new_v4(), self.relay_timeout) {
                return Ok(response);
            }
        }
    }

    /// Close the channel: signal the transport task and fail everything
    /// still pending with [`RelayError::ChannelLost`]. Idempotent.
    pub fn close(&self) {
        let was_open = !self.closed.send_replace(true);
        let failed = self.pending.fail_all(RelayError::ChannelLost);
        if was_open {
            info!(
                channel_id = %self.id,
                token = %redact_token(&self.token),
                failed_requests = failed,
                uptime_secs = self.established_at.elapsed().as_secs(),
                "Tunnel channel closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // sender lives in self, so wait_for cannot fail while we are borrowed
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("token", &redact_token(&self.token))
            .field("pending", &self.pending.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseHead;

    #[tokio::test]
    async fn test_send_reaches_transport() {
        let (channel, mut rx) = Channel::new("12345", Duration::from_secs(5));
        channel.send(Frame::Identify("ping".into())).await.unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Identify("ping".into())));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_rejects_new_work() {
        let (channel, _rx) = Channel::new("12345", Duration::from_secs(5));
        let mut response = channel.open_request().unwrap();

        channel.close();
        assert!(channel.is_closed());
        assert_eq!(response.head().await.unwrap_err(), RelayError::ChannelLost);
        assert!(matches!(channel.open_request(), Err(RelayError::ChannelLost)));
        assert_eq!(
            channel.send(Frame::Identify("x".into())).await.unwrap_err(),
            RelayError::ChannelLost
        );

        // second close is a no-op
        channel.close();
        channel.closed().await;
    }

    #[tokio::test]
    async fn test_open_request_ids_are_distinct() {
        let (channel, _rx) = Channel::new("12345", Duration::from_secs(5));
        let a = channel.open_request().unwrap();
        let b = channel.open_request().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(channel.pending().count(), 2);

        channel.pending().resolve_head(b.id(), ResponseHead { status: 204, headers: vec![] });
        assert!(channel.pending().contains(&a.id()));
    }
}
