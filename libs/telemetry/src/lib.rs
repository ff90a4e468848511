//! Logging and metric helpers shared by the relay crates.
//!
//! Logs go through `tracing` with a JSON or plain formatter picked from the
//! environment; counters and histograms go through the `metrics` facade and are
//! no-ops until a recorder is installed.

mod config;
mod context;
mod recorders;
mod tracing_init;

pub use config::TelemetryConfig;
pub use context::TelemetryLabels;
pub use recorders::{record_counter, record_gauge, record_histogram};
pub use tracing_init::{init_telemetry, with_common_fields};
