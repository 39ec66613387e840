//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: `tracing` subscriber setup with JSON/pretty/compact output
//! - **Metrics**: metric names, descriptions and recording helpers for the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use iteration_core::telemetry::{init_logging, describe_metrics, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! describe_metrics();
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{describe_metrics, IterationMetrics};
