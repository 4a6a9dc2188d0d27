//! Reverse-tunnel broker
//!
//! ```text
//!   caller ──HTTP──▶ ┌──────────────────┐          ┌──────────────────┐ ──HTTP──▶ private
//!                    │  broker server   │◀══ws═════│  broker client   │           service
//!   caller ◀──────── │  /broker/*       │  tunnel  │  filter + subst  │ ◀──────── 
//!                    └──────────────────┘          └──────────────────┘
//!                      public network                 private network
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use tunnel_broker::config::{load_config, Role};
use tunnel_broker::lifecycle::{run_client, run_server, signals, Shutdown};
use tunnel_broker::observability::{logging, metrics};
use tunnel_broker::substitution::{ProcessEnv, VariableSource};

#[derive(Parser)]
#[command(name = "tunnel-broker", version)]
#[command(about = "Relay HTTP requests into a private network over an outbound tunnel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public server
    Server {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen port, overrides the configured bind address port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the private client
    Client {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Tunnel token
        #[arg(short, long)]
        token: Option<String>,

        /// Broker server base URL
        #[arg(short, long)]
        server_url: Option<String>,
    },
}

/// Command line flags layered over the process environment.
struct Overrides(HashMap<String, String>);

impl VariableSource for Overrides {
    fn lookup(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned().or_else(|| ProcessEnv.lookup(name))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut flags = HashMap::new();
    let (role, config_path) = match cli.command {
        Commands::Server { config, port } => {
            if let Some(port) = port {
                flags.insert("PORT".to_string(), port.to_string());
            }
            (Role::Server, config)
        }
        Commands::Client {
            config,
            token,
            server_url,
        } => {
            if let Some(token) = token {
                flags.insert("BROKER_TOKEN".to_string(), token);
            }
            if let Some(url) = server_url {
                flags.insert("BROKER_SERVER_URL".to_string(), url);
            }
            (Role::Client, config)
        }
    };

    let config = load_config(config_path.as_deref(), role, &Overrides(flags))?;
    logging::init(&config.observability.log_level);
    tracing::info!(role = ?role, version = env!("CARGO_PKG_VERSION"), "tunnel-broker starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Arc::new(Shutdown::new());
    signals::spawn_signal_handler(Arc::clone(&shutdown));

    match role {
        Role::Server => run_server(config, shutdown.subscribe()).await?,
        Role::Client => run_client(config, shutdown.subscribe()).await?,
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
