//! Startup orchestration.
//!
//! Config is loaded and validated before this runs; here the role's
//! rulesets are read, listeners bound and the runtime started. Any error
//! is fatal.

use std::path::Path;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::client::{BrokerClient, ClientError};
use crate::config::{load_ruleset, BrokerConfig, ConfigError};
use crate::filters::Ruleset;
use crate::http::BrokerServer;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("server: {0}")]
    Server(std::io::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Run the public server until `shutdown` fires.
pub async fn run_server(config: BrokerConfig, shutdown: broadcast::Receiver<()>) -> Result<(), StartupError> {
    let filters = config
        .server
        .accept
        .as_deref()
        .map(|path| load_ruleset(Path::new(path)))
        .transpose()?;

    let server = BrokerServer::new(&config, filters)?;
    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .map_err(|source| StartupError::Bind {
            address: config.server.bind_address.clone(),
            source,
        })?;

    tracing::info!(
        routing_prefix = %config.server.routing_prefix,
        tunnel_path = %config.server.tunnel_path,
        server_filters = config.server.accept.is_some(),
        "Broker server starting"
    );
    server.run(listener, shutdown).await.map_err(StartupError::Server)
}

/// Run the private client until `shutdown` fires.
pub async fn run_client(config: BrokerConfig, shutdown: broadcast::Receiver<()>) -> Result<(), StartupError> {
    let ruleset = match config.client.accept.as_deref() {
        Some(path) => load_ruleset(Path::new(path))?,
        None => Ruleset::default(),
    };

    tracing::info!(
        server_url = %config.client.server_url,
        origin = %config.client.origin,
        rules = ruleset.len(),
        "Broker client starting"
    );
    BrokerClient::new(&config, ruleset).run(shutdown).await?;
    Ok(())
}
