//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML files.
//! Every field has a default, so a minimal file only names what differs.

use serde::{Deserialize, Serialize};

use crate::security::DEFAULT_AUTH_HEADER;
use crate::substitution::DEFAULT_MARKER;

/// Which half of the broker a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

/// Root configuration for both broker roles.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    /// Public side: HTTP boundary and tunnel endpoint.
    pub server: ServerConfig,

    /// Private side: tunnel dialer and dispatcher.
    pub client: ClientConfig,

    /// Request limits shared by both roles.
    pub limits: LimitsConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:7341").
    pub bind_address: String,

    /// Path prefix of relayed requests. Stripped before forwarding.
    pub routing_prefix: String,

    /// Path clients open their tunnel on.
    pub tunnel_path: String,

    /// Header carrying the broker token (case-insensitive).
    pub auth_header: String,

    /// Seconds a new tunnel has to identify itself.
    pub identify_timeout_secs: u64,

    /// Seconds to wait for a relayed response head.
    pub relay_timeout_secs: u64,

    /// Optional ruleset applied before relaying (JSON file).
    pub accept: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7341".to_string(),
            routing_prefix: "/broker".to_string(),
            tunnel_path: "/tunnel".to_string(),
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            identify_timeout_secs: 10,
            relay_timeout_secs: 30,
            accept: None,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the broker server (http, https, ws or wss).
    pub server_url: String,

    /// Tunnel path on the server, matching `server.tunnel_path`.
    pub tunnel_path: String,

    /// Token identifying this tunnel.
    pub token: String,

    /// Default private service base URL, used when a rule names no origin.
    pub origin: String,

    /// Ruleset file (JSON). Without one every request is denied.
    pub accept: Option<String>,

    /// Optional healthcheck listener (e.g., "127.0.0.1:7342").
    pub bind_address: Option<String>,

    /// Seconds allowed for a call to the private service.
    pub dispatch_timeout_secs: u64,

    /// Base delay for reconnect backoff in milliseconds.
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay for reconnect backoff in milliseconds.
    pub reconnect_max_delay_ms: u64,

    /// Reload the ruleset file when it changes.
    pub watch_filters: bool,

    /// Name of the body field listing substitution targets.
    pub substitution_marker: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            tunnel_path: "/tunnel".to_string(),
            token: String::new(),
            origin: "http://localhost:8080".to_string(),
            accept: None,
            bind_address: None,
            dispatch_timeout_secs: 30,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 10_000,
            watch_filters: false,
            substitution_marker: DEFAULT_MARKER.to_string(),
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum relayed request body in bytes.
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
