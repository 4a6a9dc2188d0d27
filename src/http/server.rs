//! Broker HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router: relay routes under the routing prefix, the
//!   tunnel upgrade path and `/healthcheck`
//! - Wire up middleware (tracing, request ID)
//! - Close every tunnel channel on shutdown so the drain can finish

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::HeaderName,
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::broker::ConnectionRegistry;
use crate::config::{BrokerConfig, ConfigError, ValidationError};
use crate::filters::Ruleset;
use crate::http::relay::relay_handler;
use crate::http::tunnel::tunnel_handler;

/// Per-request settings derived from configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub routing_prefix: String,
    pub auth_header: HeaderName,
    pub identify_timeout: Duration,
    pub relay_timeout: Duration,
    pub max_body_size: usize,
}

impl RelaySettings {
    pub fn from_config(config: &BrokerConfig) -> Result<Self, ConfigError> {
        let server = &config.server;
        let auth_header = HeaderName::from_bytes(server.auth_header.as_bytes()).map_err(|_| {
            ConfigError::Validation(vec![ValidationError {
                field: "server.auth_header",
                message: "is not a valid header name".to_string(),
            }])
        })?;
        Ok(Self {
            routing_prefix: server.routing_prefix.clone(),
            auth_header,
            identify_timeout: Duration::from_secs(server.identify_timeout_secs),
            relay_timeout: Duration::from_secs(server.relay_timeout_secs),
            max_body_size: config.limits.max_body_size,
        })
    }
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub settings: Arc<RelaySettings>,
    /// Server-side accept rules; `None` relays everything authenticated.
    pub filters: Option<Arc<Ruleset>>,
}

/// The public half of the broker.
pub struct BrokerServer {
    router: Router,
    registry: Arc<ConnectionRegistry>,
}

impl BrokerServer {
    /// Create a server from validated configuration.
    pub fn new(config: &BrokerConfig, filters: Option<Ruleset>) -> Result<Self, ConfigError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let state = AppState {
            registry: Arc::clone(&registry),
            settings: Arc::new(RelaySettings::from_config(config)?),
            filters: filters.map(Arc::new),
        };
        let router = Self::build_router(config, state);
        Ok(Self { router, registry })
    }

    fn build_router(config: &BrokerConfig, state: AppState) -> Router {
        let prefix = &config.server.routing_prefix;
        Router::new()
            .route("/healthcheck", get(healthcheck))
            .route(&config.server.tunnel_path, get(tunnel_handler))
            .route(prefix, any(relay_handler))
            .route(&format!("{prefix}/"), any(relay_handler))
            .route(&format!("{prefix}/{{*path}}"), any(relay_handler))
            .with_state(state)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// The router, for embedding or in-process tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Broker server listening");

        let registry = Arc::clone(&self.registry);
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!(channels = registry.len(), "Closing tunnel channels");
                // open websockets would otherwise hold the drain forever
                registry.close_all();
            })
            .await?;

        tracing::info!("Broker server stopped");
        Ok(())
    }
}

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "connections": state.registry.len() }))
}
