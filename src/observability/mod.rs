//! Logs and metrics.
//!
//! # Data Flow
//! ```text
//! listeners, servers, coordinator
//!     → logging.rs: tracing events, JSON or pretty, to stdout
//!     → metrics.rs: request, connection and restart series
//!         → optional Prometheus scrape listener
//! ```
//!
//! # Design Decisions
//! - Every request log line carries its `x-request-id`
//! - Recording a metric without an installed recorder is a no-op

pub mod logging;
pub mod metrics;
