//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, prefixes well formed)
//! - Check the fields a role needs are present
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BrokerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use url::Url;

use crate::config::schema::{BrokerConfig, Role};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate `config` for running as `role`.
pub fn validate_config(config: &BrokerConfig, role: Role) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.limits.max_body_size == 0 {
        errors.push(ValidationError::new("limits.max_body_size", "must be greater than 0"));
    }

    match role {
        Role::Server => validate_server(config, &mut errors),
        Role::Client => validate_client(config, &mut errors),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_server(config: &BrokerConfig, errors: &mut Vec<ValidationError>) {
    let server = &config.server;
    let prefix = &server.routing_prefix;
    if !prefix.starts_with('/') || prefix.ends_with('/') || prefix.len() < 2 {
        errors.push(ValidationError::new(
            "server.routing_prefix",
            "must start with '/', not end with '/' and not be the root",
        ));
    }
    if !server.tunnel_path.starts_with('/') {
        errors.push(ValidationError::new("server.tunnel_path", "must start with '/'"));
    }
    if server.tunnel_path.starts_with(&format!("{prefix}/")) || server.tunnel_path == *prefix {
        errors.push(ValidationError::new("server.tunnel_path", "must not live under the routing prefix"));
    }
    if axum::http::HeaderName::from_bytes(server.auth_header.as_bytes()).is_err() {
        errors.push(ValidationError::new("server.auth_header", "is not a valid header name"));
    }
    if server.identify_timeout_secs == 0 {
        errors.push(ValidationError::new("server.identify_timeout_secs", "must be greater than 0"));
    }
    if server.relay_timeout_secs == 0 {
        errors.push(ValidationError::new("server.relay_timeout_secs", "must be greater than 0"));
    }
}

fn validate_client(config: &BrokerConfig, errors: &mut Vec<ValidationError>) {
    let client = &config.client;
    if client.token.is_empty() {
        errors.push(ValidationError::new("client.token", "is required"));
    }
    match Url::parse(&client.server_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "ws" | "wss") => {}
        Ok(url) => errors.push(ValidationError::new(
            "client.server_url",
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new("client.server_url", e.to_string())),
    }
    if !client.tunnel_path.starts_with('/') {
        errors.push(ValidationError::new("client.tunnel_path", "must start with '/'"));
    }
    if client.dispatch_timeout_secs == 0 {
        errors.push(ValidationError::new("client.dispatch_timeout_secs", "must be greater than 0"));
    }
    if client.reconnect_base_delay_ms > client.reconnect_max_delay_ms {
        errors.push(ValidationError::new(
            "client.reconnect_base_delay_ms",
            "must not exceed reconnect_max_delay_ms",
        ));
    }
    if client.substitution_marker.is_empty() {
        errors.push(ValidationError::new("client.substitution_marker", "must not be empty"));
    }
}
