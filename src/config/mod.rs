//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (environment overrides: BROKER_TOKEN, ACCEPT, PORT, ...)
//!     → validation.rs (semantic checks for the selected role)
//!     → BrokerConfig (validated, immutable)
//!
//! ruleset file (JSON)
//!     → loader.rs (load_ruleset)
//!     → Ruleset handed to the filter engine
//!
//! On ruleset change (client, opt-in):
//!     watcher.rs detects change
//!     → loader.rs loads new ruleset
//!     → atomic swap, in-flight requests keep the rules they started with
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_ruleset, ConfigError, ConfigResult};
pub use schema::{BrokerConfig, ClientConfig, LimitsConfig, ObservabilityConfig, Role, ServerConfig};
pub use validation::ValidationError;
pub use watcher::FilterWatcher;
