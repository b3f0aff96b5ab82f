//! Observability for the device agent
//!
//! Structured logging, process-wide metrics and the optional health
//! check HTTP server.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{command_span, lifecycle_span, telemetry_span, twin_span};
