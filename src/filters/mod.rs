//! Request filtering subsystem.
//!
//! # Data Flow
//! ```text
//! accept file (JSON list of rules)
//!     → rule.rs (deserialize FilterRule)
//!     → Ruleset::new (compile path patterns once)
//!
//! Relayed request (method, path, body)
//!     → engine.rs (first matching rule wins)
//!     → matcher.rs (segment-wise path match)
//!     → Return: Allow(rule) or Deny
//! ```
//!
//! # Design Decisions
//! - Deny by default: an empty ruleset denies everything
//! - Rules compiled at load time, immutable afterwards
//! - Body is only parsed when a candidate rule carries a body predicate
//! - Same input always yields the same verdict

pub mod engine;
pub mod matcher;
pub mod rule;

pub use engine::{evaluate, Ruleset, Verdict};
pub use matcher::{PathCaptures, PathPattern};
pub use rule::{BodyPredicate, FilterRule};
