//! # Stream Metrics
//!
//! Best-effort metrics sink shared by the batch consumer and the DB poller.
//!
//! Components emit events through [`MetricsSink`] instead of touching a global
//! registry directly, so the sink is constructed once at startup and passed to
//! each component. Recording a metric must never block the caller for long and
//! must never panic: registration or label mismatches are logged and dropped.
//!
//! Tags are `(key, value)` pairs, e.g. `("status", "batch_received")`.
//!
//! ```rust
//! use std::sync::Arc;
//! use stream_metrics::{MetricsSink, RecordingMetricsSink};
//!
//! let sink = Arc::new(RecordingMetricsSink::default());
//! sink.increment("handler", &[("status", "batch_received"), ("topic", "orders")], 1);
//! assert_eq!(sink.counter_total("handler", &[("status", "batch_received")]), 1);
//! ```

use std::sync::Arc;

mod prometheus_sink;
mod recording;

pub use prometheus_sink::PrometheusMetricsSink;
pub use recording::{RecordedMetric, RecordingMetricsSink};

/// A single metric tag.
pub type Tag<'a> = (&'a str, &'a str);

/// Shared handle to a metrics sink.
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Destination for counters and histograms.
pub trait MetricsSink: Send + Sync {
    /// Increment the counter `name` by `by`.
    fn increment(&self, name: &str, tags: &[Tag<'_>], by: u64);

    /// Record one observation of `value` for the histogram `name`.
    fn histogram(&self, name: &str, value: f64, tags: &[Tag<'_>]);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _name: &str, _tags: &[Tag<'_>], _by: u64) {}

    fn histogram(&self, _name: &str, _value: f64, _tags: &[Tag<'_>]) {}
}

/// Convenience constructor for a shared no-op sink.
pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetricsSink)
}
