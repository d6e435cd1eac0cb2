use std::sync::Mutex;

use crate::{MetricsSink, Tag};

/// One event captured by [`RecordingMetricsSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedMetric {
    Counter {
        name: String,
        tags: Vec<(String, String)>,
        by: u64,
    },
    Histogram {
        name: String,
        tags: Vec<(String, String)>,
        value: f64,
    },
}

impl RecordedMetric {
    fn matches(&self, wanted: &str, filter: &[Tag<'_>]) -> bool {
        let (name, tags) = match self {
            RecordedMetric::Counter { name, tags, .. } => (name, tags),
            RecordedMetric::Histogram { name, tags, .. } => (name, tags),
        };
        name == wanted
            && filter
                .iter()
                .all(|(k, v)| tags.iter().any(|(tk, tv)| tk == k && tv == v))
    }
}

/// In-memory sink that keeps every event, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    events: Mutex<Vec<RecordedMetric>>,
}

impl RecordingMetricsSink {
    pub fn events(&self) -> Vec<RecordedMetric> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sum of all increments of `name` whose tags include every tag in `filter`.
    pub fn counter_total(&self, name: &str, filter: &[Tag<'_>]) -> u64 {
        self.events()
            .iter()
            .filter(|e| e.matches(name, filter))
            .map(|e| match e {
                RecordedMetric::Counter { by, .. } => *by,
                RecordedMetric::Histogram { .. } => 0,
            })
            .sum()
    }

    /// Number of observations of histogram `name` matching `filter`.
    pub fn histogram_count(&self, name: &str, filter: &[Tag<'_>]) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RecordedMetric::Histogram { .. }) && e.matches(name, filter))
            .count()
    }

    fn push(&self, event: RecordedMetric) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

fn owned(tags: &[Tag<'_>]) -> Vec<(String, String)> {
    tags.iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

impl MetricsSink for RecordingMetricsSink {
    fn increment(&self, name: &str, tags: &[Tag<'_>], by: u64) {
        self.push(RecordedMetric::Counter {
            name: name.to_string(),
            tags: owned(tags),
            by,
        });
    }

    fn histogram(&self, name: &str, value: f64, tags: &[Tag<'_>]) {
        self.push(RecordedMetric::Histogram {
            name: name.to_string(),
            tags: owned(tags),
            value,
        });
    }
}
