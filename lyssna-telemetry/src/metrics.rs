//! Prometheus metrics registry.

use prometheus::{Counter, Histogram, HistogramOpts, Registry};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub sources_opened: Counter,
    pub source_errors: Counter,
    pub frames_received: Counter,
    pub packets_published: Counter,
    pub probe_latency: Histogram,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();
        let sources_opened =
            Counter::new("lyssna_sources_opened_total", "Capture sources opened").unwrap();
        let source_errors =
            Counter::new("lyssna_source_errors_total", "Capture source errors").unwrap();
        let frames_received =
            Counter::new("lyssna_frames_received_total", "Worker frames received").unwrap();
        let packets_published = Counter::new(
            "lyssna_packets_published_total",
            "Decoded packets published on the event bus",
        )
        .unwrap();
        let probe_latency = Histogram::with_opts(
            HistogramOpts::new(
                "lyssna_probe_latency_seconds",
                "Time from probe start to driver resolution",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        registry.register(Box::new(sources_opened.clone())).unwrap();
        registry.register(Box::new(source_errors.clone())).unwrap();
        registry
            .register(Box::new(frames_received.clone()))
            .unwrap();
        registry
            .register(Box::new(packets_published.clone()))
            .unwrap();
        registry.register(Box::new(probe_latency.clone())).unwrap();

        Self {
            registry,
            sources_opened,
            source_errors,
            frames_received,
            packets_published,
            probe_latency,
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}
