//! Token to channel bindings.
//!
//! # Responsibilities
//! - Bind a token to its live tunnel channel
//! - Replace (and close) a previous binding on re-identify
//! - Drop a binding when its channel terminates
//!
//! # Design Decisions
//! - Exact token equality, O(1) lookups
//! - Per-key atomic insert/remove, lookups never see a half-updated binding
//! - Removal on disconnect only removes the binding if it still points at
//!   the disconnecting channel, so a stale channel cannot evict its successor

use std::sync::Arc;

use dashmap::DashMap;

use crate::broker::channel::Channel;
use crate::net::{redact_token, ChannelId};
use crate::observability::metrics;

/// Live tunnel channels keyed by token.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Channel>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `token` to `channel`, returning the binding it replaced.
    ///
    /// The caller owns closing the returned channel.
    pub fn register(&self, token: impl Into<String>, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        let token = token.into();
        tracing::info!(
            token = %redact_token(&token),
            channel_id = %channel.id(),
            "Registering tunnel channel"
        );
        let previous = self.connections.insert(token, channel);
        metrics::record_connections(self.connections.len());
        previous
    }

    /// Whether `token` is bound to a live channel.
    pub fn has(&self, token: &str) -> bool {
        self.get(token).is_some()
    }

    /// The live channel bound to `token`.
    pub fn get(&self, token: &str) -> Option<Arc<Channel>> {
        self.connections
            .get(token)
            .map(|r| Arc::clone(r.value()))
            .filter(|channel| !channel.is_closed())
    }

    /// Remove the binding for `token` whatever channel it points at.
    pub fn unregister(&self, token: &str) -> Option<Arc<Channel>> {
        let removed = self.connections.remove(token).map(|(_, channel)| channel);
        metrics::record_connections(self.connections.len());
        removed
    }

    /// Remove the binding for `token` only if it is still `channel_id`.
    pub fn release(&self, token: &str, channel_id: ChannelId) -> bool {
        let removed = self
            .connections
            .remove_if(token, |_, channel| channel.id() == channel_id)
            .is_some();
        if removed {
            metrics::record_connections(self.connections.len());
        }
        removed
    }

    /// Close and forget every channel.
    pub fn close_all(&self) {
        let channels: Vec<Arc<Channel>> = self.connections.iter().map(|r| Arc::clone(r.value())).collect();
        self.connections.clear();
        for channel in channels {
            channel.close();
        }
        metrics::record_connections(0);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
