//! Structured logging setup.
//!
//! The core runs several named threads (event-bus dispatcher, timer,
//! per-worker I/O); thread names are part of every line so interleaved
//! source logs stay readable.

use tracing_subscriber::EnvFilter;

pub struct EventLogger;

impl EventLogger {
    /// Install the global subscriber, honoring `RUST_LOG` with `filter`
    /// as the fallback.
    pub fn init(filter: &str) {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
            )
            .with_thread_names(true)
            .init();
    }

    /// Log one structured lifecycle event.
    pub fn log_event(event_type: &str, fields: &[(&str, String)]) {
        tracing::info!(event_type, fields = ?fields, "lifecycle event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn log_event_is_recorded() {
        EventLogger::log_event("source_opened", &[("interface", "wlan0".to_string())]);
        assert!(logs_contain("lifecycle event"));
    }
}
