use dashmap::DashMap;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::warn;

use crate::{MetricsSink, Tag};

/// Prometheus-backed sink.
///
/// Metric families are created lazily on first use, keyed by name, with the
/// tag keys of that first call as label names. Later calls with a different
/// label set are dropped with a warning.
pub struct PrometheusMetricsSink {
    namespace: String,
    registry: Registry,
    counters: DashMap<String, IntCounterVec>,
    histograms: DashMap<String, HistogramVec>,
}

impl std::fmt::Debug for PrometheusMetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetricsSink")
            .field("namespace", &self.namespace)
            .field("counters", &self.counters.len())
            .field("histograms", &self.histograms.len())
            .finish()
    }
}

impl PrometheusMetricsSink {
    /// Create a sink registering into the process-wide default registry.
    pub fn new(namespace: &str) -> Self {
        Self::with_registry(namespace, prometheus::default_registry().clone())
    }

    /// Create a sink registering into `registry`.
    pub fn with_registry(namespace: &str, registry: Registry) -> Self {
        Self {
            namespace: sanitize(namespace),
            registry,
            counters: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn counter(&self, name: &str, label_names: &[String]) -> Option<IntCounterVec> {
        if let Some(existing) = self.counters.get(name) {
            return Some(existing.clone());
        }

        let labels: Vec<&str> = label_names.iter().map(String::as_str).collect();
        // Counters get a `_total` suffix so a histogram may share the base name.
        let opts = Opts::new(format!("{name}_total"), format!("Counter {name}"))
            .namespace(self.namespace.clone());
        let counter = match IntCounterVec::new(opts, &labels) {
            Ok(counter) => counter,
            Err(e) => {
                warn!(metric = %name, error = %e, "Invalid counter definition, dropping");
                return None;
            }
        };

        if let Err(e) = self.registry.register(Box::new(counter.clone())) {
            warn!(metric = %name, error = %e, "Failed to register counter");
        }

        Some(self.counters.entry(name.to_string()).or_insert(counter).clone())
    }

    fn histogram_vec(&self, name: &str, label_names: &[String]) -> Option<HistogramVec> {
        if let Some(existing) = self.histograms.get(name) {
            return Some(existing.clone());
        }

        let labels: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let opts =
            HistogramOpts::new(name, format!("Histogram {name}")).namespace(self.namespace.clone());
        let histogram = match HistogramVec::new(opts, &labels) {
            Ok(histogram) => histogram,
            Err(e) => {
                warn!(metric = %name, error = %e, "Invalid histogram definition, dropping");
                return None;
            }
        };

        if let Err(e) = self.registry.register(Box::new(histogram.clone())) {
            warn!(metric = %name, error = %e, "Failed to register histogram");
        }

        Some(
            self.histograms
                .entry(name.to_string())
                .or_insert(histogram)
                .clone(),
        )
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn increment(&self, name: &str, tags: &[Tag<'_>], by: u64) {
        let name = sanitize(name);
        let (label_names, label_values) = split_tags(tags);
        let Some(counter) = self.counter(&name, &label_names) else {
            return;
        };

        let values: Vec<&str> = label_values.iter().map(String::as_str).collect();
        match counter.get_metric_with_label_values(&values) {
            Ok(metric) => metric.inc_by(by),
            Err(e) => warn!(metric = %name, error = %e, "Counter label mismatch, dropping"),
        }
    }

    fn histogram(&self, name: &str, value: f64, tags: &[Tag<'_>]) {
        let name = sanitize(name);
        let (label_names, label_values) = split_tags(tags);
        let Some(histogram) = self.histogram_vec(&name, &label_names) else {
            return;
        };

        let values: Vec<&str> = label_values.iter().map(String::as_str).collect();
        match histogram.get_metric_with_label_values(&values) {
            Ok(metric) => metric.observe(value),
            Err(e) => warn!(metric = %name, error = %e, "Histogram label mismatch, dropping"),
        }
    }
}

/// Sort tags by key so label order is stable regardless of call site order.
fn split_tags(tags: &[Tag<'_>]) -> (Vec<String>, Vec<String>) {
    let mut sorted: Vec<&Tag<'_>> = tags.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .into_iter()
        .map(|(k, v)| (sanitize(k), (*v).to_string()))
        .unzip()
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
