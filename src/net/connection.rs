//! Tunnel channel identity.
//!
//! Tokens name a binding, not a transport: a reconnecting client reuses its
//! token on a fresh channel. `ChannelId` tells the two apart in logs and in
//! the registry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Relaxed ordering is enough, only uniqueness matters.
static CHANNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one tunnel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn new() -> Self {
        Self(CHANNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// Short, log-safe rendering of a token.
pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    if token.chars().count() > 4 {
        format!("{prefix}…")
    } else {
        "****".to_string()
    }
}
