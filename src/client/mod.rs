//! Private half of the broker.
//!
//! # Data Flow
//! ```text
//! BrokerClient::run
//!     → connection.rs (dial {server_url}{tunnel_path}, send token)
//!     → connection.rs (reassemble RequestHead, Chunk*, End)
//!     → dispatch.rs   (filter → substitute → private service → reply frames)
//!     → on tunnel loss: backoff, dial again
//! ```
//!
//! # Design Decisions
//! - The ruleset lives behind an `ArcSwap`, so hot reload never blocks
//!   requests already being screened
//! - Each request is dispatched on its own task; a slow private service
//!   never stalls other requests on the tunnel

pub mod connection;
pub mod dispatch;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use notify::RecommendedWatcher;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::{BrokerConfig, ClientConfig, ConfigError, FilterWatcher};
use crate::filters::Ruleset;
use crate::protocol::ProtocolError;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;
use crate::substitution::VariableSource;

pub use connection::{tunnel_url, SessionEnd};
pub use dispatch::{ClientVariables, Dispatcher, InboundRequest, SharedRuleset};

/// Errors that stop the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported server url scheme '{0}'")]
    Scheme(String),

    #[error("tunnel transport: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("tunnel protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("filter watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("healthcheck listener: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Reconnecting tunnel client.
pub struct BrokerClient {
    config: ClientConfig,
    max_body_size: usize,
    filters: SharedRuleset,
    vars: Arc<dyn VariableSource + Send + Sync>,
    connected: Arc<AtomicBool>,
}

impl BrokerClient {
    /// Create a client screening requests with `ruleset`.
    pub fn new(config: &BrokerConfig, ruleset: Ruleset) -> Self {
        if ruleset.is_empty() {
            tracing::warn!("Client ruleset is empty, every relayed request will be blocked");
        }
        Self {
            vars: Arc::new(ClientVariables::new(&config.client.token)),
            config: config.client.clone(),
            max_body_size: config.limits.max_body_size,
            filters: Arc::new(ArcSwap::from_pointee(ruleset)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the substitution variable source.
    pub fn with_variables(mut self, vars: Arc<dyn VariableSource + Send + Sync>) -> Self {
        self.vars = vars;
        self
    }

    /// Handle to the live ruleset, for swapping rules in place.
    pub fn filters(&self) -> SharedRuleset {
        Arc::clone(&self.filters)
    }

    /// Shared flag, true while a tunnel is identified.
    pub fn connected(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Keep a tunnel open until `shutdown` fires, reconnecting with
    /// backoff whenever it drops.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> ClientResult<()> {
        let url = tunnel_url(&self.config.server_url, &self.config.tunnel_path)?;
        let _watcher = self.watch_filters()?;
        if let Some(addr) = &self.config.bind_address {
            self.serve_healthcheck(addr, shutdown.resubscribe()).await?;
        }

        let dispatcher = Dispatcher::new(&self.config, Arc::clone(&self.filters), Arc::clone(&self.vars));
        let mut backoff = Backoff::new(
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
        );

        loop {
            let dialed = tokio::select! {
                dialed = connection::connect(&url, &self.config.token) => dialed,
                _ = shutdown.recv() => break,
            };

            match dialed {
                Ok(ws) => {
                    backoff.reset();
                    self.connected.store(true, Ordering::Release);
                    let end = connection::serve(ws, &dispatcher, self.max_body_size, &mut shutdown).await;
                    self.connected.store(false, Ordering::Release);
                    if end == SessionEnd::Shutdown {
                        break;
                    }
                    tracing::warn!(url = %url, "Tunnel lost");
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "Tunnel connect failed"),
            }

            let delay = backoff.next_delay();
            metrics::record_reconnect();
            tracing::info!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempt(), "Reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!("Broker client stopped");
        Ok(())
    }

    fn watch_filters(&self) -> ClientResult<Option<RecommendedWatcher>> {
        let path = match (&self.config.accept, self.config.watch_filters) {
            (Some(path), true) => PathBuf::from(path),
            _ => return Ok(None),
        };

        let (watcher, mut updates) = FilterWatcher::new(&path);
        let watcher = watcher.run()?;
        let filters = Arc::clone(&self.filters);
        tokio::spawn(async move {
            while let Some(ruleset) = updates.recv().await {
                tracing::info!(rules = ruleset.len(), "Filter rules swapped");
                filters.store(Arc::new(ruleset));
            }
        });
        Ok(Some(watcher))
    }

    async fn serve_healthcheck(&self, addr: &str, mut shutdown: broadcast::Receiver<()>) -> ClientResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let router = Router::new()
            .route("/healthcheck", get(healthcheck))
            .with_state(Arc::clone(&self.connected));

        tracing::info!(address = %local, "Client healthcheck listening");
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Client healthcheck listener failed");
            }
        });
        Ok(local)
    }
}

async fn healthcheck(State(connected): State<Arc<AtomicBool>>) -> impl IntoResponse {
    Json(json!({ "ok": true, "connected": connected.load(Ordering::Acquire) }))
}
