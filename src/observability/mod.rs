//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, RUST_LOG aware)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Correlation ids and channel ids flow through log fields
//! - Tokens are only ever logged redacted
//! - Metrics are cheap (facade calls are no-ops without an exporter)

pub mod logging;
pub mod metrics;
