//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! gateway, dispatcher, registry, sessions
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG)
//!     → Prometheus scrape endpoint
//! ```

pub mod logging;
pub mod metrics;
