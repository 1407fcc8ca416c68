//! # lyssna telemetry
//!
//! Logging and metrics for the capture-source management core.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
