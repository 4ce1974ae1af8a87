//! In-process timing histograms.
//! Tracks p50/p95/p99 for batch processing, recording enqueue and analysis runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// A span measuring elapsed time from creation to explicit end.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn new(name: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            name,
            start: Instant::now(),
            registry,
        }
    }

    /// End the span, recording elapsed duration in microseconds.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }
}

/// Fixed-capacity window of the most recent values of one metric.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.count - 1)]
    }
}

/// Stores histograms for all named metrics.
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            ring_capacity: 1024,
        }
    }

    /// Record a sample (in microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        tracing::trace!(metric = name, value_us = value_us, "metric_recorded");
    }

    /// Start a timing span that records on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Percentile (0-100) of a metric in microseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        let hists = self.histograms.lock();
        hists.get(name).map(|ring| ring.percentile(p)).unwrap_or(0.0)
    }

    pub fn count(&self, name: &str) -> usize {
        self.histograms.lock().get(name).map(|ring| ring.count).unwrap_or(0)
    }

    /// Summary of all metrics at p50/p95/p99.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let hists = self.histograms.lock();
        hists
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_us: ring.percentile(50.0),
                        p95_us: ring.percentile(95.0),
                        p99_us: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Well-known metric names.
pub mod metric_names {
    pub const BATCH_PROCESSED: &str = "t_batch_processed";
    pub const RECORDING_ENQUEUE: &str = "t_recording_enqueue";
    pub const SOURCE_SWITCH: &str = "t_source_switch";
    pub const FIND_SPIKES: &str = "t_find_spikes";
    pub const AUTOCORRELATION: &str = "t_autocorrelation";
    pub const ISI: &str = "t_isi";
    pub const CROSS_CORRELATION: &str = "t_cross_correlation";
    pub const AVERAGE_SPIKE: &str = "t_average_spike";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_recorded_values() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::BATCH_PROCESSED, v as f64);
        }
        assert_eq!(registry.count(metric_names::BATCH_PROCESSED), 100);
        assert_eq!(registry.percentile(metric_names::BATCH_PROCESSED, 0.0), 1.0);
        assert_eq!(registry.percentile(metric_names::BATCH_PROCESSED, 100.0), 100.0);
        let summary = registry.summary();
        assert_eq!(summary[metric_names::BATCH_PROCESSED].count, 100);
    }

    #[test]
    fn unknown_metric_reads_as_zero() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.percentile("missing", 50.0), 0.0);
        assert_eq!(registry.count("missing"), 0);
    }

    #[test]
    fn span_records_on_finish() {
        let registry = Arc::new(MetricsRegistry::new());
        let span = registry.span(metric_names::ISI);
        span.finish();
        assert_eq!(registry.count(metric_names::ISI), 1);
    }
}
