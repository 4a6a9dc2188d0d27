//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{BrokerConfig, Role};
use crate::config::validation::{validate_config, ValidationError};
use crate::filters::{FilterRule, Ruleset};
use crate::substitution::VariableSource;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Ruleset parse error: {0}")]
    Ruleset(#[from] serde_json::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Load, override from the environment, and validate a configuration.
///
/// Without a path the defaults are used as the base.
pub fn load_config(path: Option<&Path>, role: Role, env: &dyn VariableSource) -> ConfigResult<BrokerConfig> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        }
        None => BrokerConfig::default(),
    };

    apply_env_overrides(&mut config, role, env);
    validate_config(&config, role).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Environment variables that override file settings.
///
/// - `BROKER_TOKEN`, `BROKER_SERVER_URL`, `BROKER_ORIGIN`: client settings
/// - `ACCEPT`: ruleset file for the selected role
/// - `PORT`: listen port for the selected role
pub fn apply_env_overrides(config: &mut BrokerConfig, role: Role, env: &dyn VariableSource) {
    if let Some(token) = env.lookup("BROKER_TOKEN") {
        config.client.token = token;
    }
    if let Some(url) = env.lookup("BROKER_SERVER_URL") {
        config.client.server_url = url;
    }
    if let Some(origin) = env.lookup("BROKER_ORIGIN") {
        config.client.origin = origin;
    }
    if let Some(accept) = env.lookup("ACCEPT") {
        match role {
            Role::Server => config.server.accept = Some(accept),
            Role::Client => config.client.accept = Some(accept),
        }
    }
    if let Some(port) = env.lookup("PORT").and_then(|p| p.parse::<u16>().ok()) {
        match role {
            Role::Server => config.server.bind_address = with_port(&config.server.bind_address, port),
            Role::Client => {
                let base = config.client.bind_address.as_deref().unwrap_or("0.0.0.0:0");
                config.client.bind_address = Some(with_port(base, port));
            }
        }
    }
}

fn with_port(address: &str, port: u16) -> String {
    let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
    format!("{host}:{port}")
}

/// Load a ruleset file: a JSON array of rules.
pub fn load_ruleset(path: &Path) -> ConfigResult<Ruleset> {
    let content = fs::read_to_string(path)?;
    let rules: Vec<FilterRule> = serde_json::from_str(&content)?;
    tracing::info!(path = %path.display(), rules = rules.len(), "Loaded filter rules");
    Ok(Ruleset::new(rules))
}
