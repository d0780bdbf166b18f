//! Optional metrics sink.
//!
//! Fire-and-forget counters, gauges and histograms for stream lifecycle
//! and workflow outcomes. Nothing in the crate depends on a sink being
//! present; the default discards everything.

use tracing::debug;

/// Destination for operational metrics
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, value: u64);
    fn gauge(&self, name: &str, value: f64);
    fn histogram(&self, name: &str, value: f64);
}

/// Sink that drops every measurement
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _value: u64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn histogram(&self, _name: &str, _value: f64) {}
}

/// Sink that emits measurements as debug-level tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &str, value: u64) {
        debug!(target: "conduit::metrics", metric = name, value, "counter");
    }

    fn gauge(&self, name: &str, value: f64) {
        debug!(target: "conduit::metrics", metric = name, value, "gauge");
    }

    fn histogram(&self, name: &str, value: f64) {
        debug!(target: "conduit::metrics", metric = name, value, "histogram");
    }
}
