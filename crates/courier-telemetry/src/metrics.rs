use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Histograms keep at most this many recent observations.
const HISTOGRAM_WINDOW: usize = 1024;

/// Type of metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// One metric's value at snapshot time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub metric_type: MetricType,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<HistogramSummary>,
}

/// Point-in-time view of every recorded metric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub metrics: Vec<MetricValue>,
}

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Can go up or down.
struct Gauge {
    // f64 bits, so the gauge can be updated atomically
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn increment(&self, delta: f64) {
        loop {
            let current = self.value.load(Ordering::Relaxed);
            let current_f = f64::from_bits(current as u64);
            let new_f = current_f + delta;
            if self
                .value
                .compare_exchange_weak(
                    current,
                    new_f.to_bits() as i64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// In-memory histogram over a sliding window of recent observations.
struct Histogram {
    observations: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::new()),
        }
    }
    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.pop_front();
        }
        obs.push_back(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let p50 = sorted[count / 2];
        let p95 = sorted[(count as f64 * 0.95) as usize];
        let p99 = sorted[((count as f64 * 0.99) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum,
            p50,
            p95,
            p99,
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }

    fn labels_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        let mut counters = self.counters.write();
        let c = counters.entry(key).or_insert_with(Counter::new);
        c.increment(n);
    }

    /// Increment/decrement a gauge by delta.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.increment(delta);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        let g = gauges.entry(key).or_insert_with(Gauge::new);
        g.increment(delta);
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(&key) {
            h.observe(value);
            return;
        }
        drop(histograms);
        let mut histograms = self.histograms.write();
        let h = histograms.entry(key).or_insert_with(Histogram::new);
        h.observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, |c| c.get())
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, |g| g.get())
    }

    /// Capture every metric, sorted by name.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut metrics = Vec::new();

        for (key, counter) in self.counters.read().iter() {
            metrics.push(MetricValue {
                name: key.name.clone(),
                metric_type: MetricType::Counter,
                labels: key.labels_map(),
                value: counter.get() as f64,
                summary: None,
            });
        }

        for (key, gauge) in self.gauges.read().iter() {
            metrics.push(MetricValue {
                name: key.name.clone(),
                metric_type: MetricType::Gauge,
                labels: key.labels_map(),
                value: gauge.get(),
                summary: None,
            });
        }

        // Histograms report p50 as their headline value
        for (key, histogram) in self.histograms.read().iter() {
            let summary = histogram.summary();
            metrics.push(MetricValue {
                name: key.name.clone(),
                metric_type: MetricType::Histogram,
                labels: key.labels_map(),
                value: summary.p50,
                summary: Some(summary),
            });
        }

        metrics.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary_of(recorder: &MetricsRecorder, name: &str) -> HistogramSummary {
        recorder
            .snapshot()
            .metrics
            .into_iter()
            .find(|m| m.name == name && m.metric_type == MetricType::Histogram)
            .and_then(|m| m.summary)
            .unwrap_or_default()
    }

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("dispatch.total", &[("outcome", "ok")], 1);
        recorder.counter_inc("dispatch.total", &[("outcome", "ok")], 1);
        recorder.counter_inc("dispatch.total", &[("outcome", "timeout")], 1);

        assert_eq!(recorder.counter_get("dispatch.total", &[("outcome", "ok")]), 2);
        assert_eq!(recorder.counter_get("dispatch.total", &[("outcome", "timeout")]), 1);
        assert_eq!(recorder.counter_get("dispatch.total", &[("outcome", "other")]), 0);
    }

    #[test]
    fn gauge_increments() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("agents.connected", &[], 10.0);
        assert_eq!(recorder.gauge_get("agents.connected", &[]), 10.0);

        recorder.gauge_inc("agents.connected", &[], 5.0);
        assert_eq!(recorder.gauge_get("agents.connected", &[]), 15.0);

        recorder.gauge_inc("agents.connected", &[], -3.0);
        assert_eq!(recorder.gauge_get("agents.connected", &[]), 12.0);
    }

    #[test]
    fn gauge_inc_from_zero() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("agents.connected", &[], 1.0);
        recorder.gauge_inc("agents.connected", &[], -1.0);
        assert_eq!(recorder.gauge_get("agents.connected", &[]), 0.0);
    }

    #[test]
    fn histogram_observations() {
        let recorder = MetricsRecorder::new();

        for v in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            recorder.histogram_observe("dispatch.latency_ms", &[], v);
        }

        let summary = summary_of(&recorder, "dispatch.latency_ms");
        assert_eq!(summary.count, 10);
        assert_eq!(summary.sum, 550.0);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 60.0);
        assert!(summary.p95 >= 90.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for i in 0..(HISTOGRAM_WINDOW + 100) {
            recorder.histogram_observe("h", &[], i as f64);
        }
        let summary = summary_of(&recorder, "h");
        assert_eq!(summary.count, HISTOGRAM_WINDOW as u64);
    }

    #[test]
    fn histogram_empty() {
        let recorder = MetricsRecorder::new();
        let summary = summary_of(&recorder, "nonexistent");
        assert_eq!(summary.count, 0);
        assert_eq!(summary.sum, 0.0);
    }

    #[test]
    fn snapshot_contains_all_kinds() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("courier.dispatch.total", &[("outcome", "ok")], 42);
        recorder.gauge_inc("courier.agents.connected", &[], 5.0);
        recorder.histogram_observe("courier.dispatch.latency_ms", &[], 123.0);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.metrics.len(), 3);

        let counter = snapshot
            .metrics
            .iter()
            .find(|m| m.name == "courier.dispatch.total")
            .unwrap();
        assert_eq!(counter.metric_type, MetricType::Counter);
        assert_eq!(counter.value, 42.0);
        assert_eq!(counter.labels["outcome"], "ok");

        let histogram = snapshot
            .metrics
            .iter()
            .find(|m| m.metric_type == MetricType::Histogram)
            .unwrap();
        assert_eq!(histogram.summary.as_ref().unwrap().count, 1);
    }

    #[test]
    fn label_ordering_independent() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("test", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("test", &[("b", "2"), ("a", "1")], 1);

        assert_eq!(recorder.counter_get("test", &[("a", "1"), ("b", "2")]), 2);
        assert_eq!(recorder.counter_get("test", &[("b", "2"), ("a", "1")]), 2);
    }

    #[test]
    fn snapshot_serializes() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("g", &[], 1.5);
        let json = serde_json::to_value(recorder.snapshot()).unwrap();
        assert_eq!(json["metrics"][0]["metric_type"], "gauge");
        assert_eq!(json["metrics"][0]["value"], 1.5);
        assert!(json["metrics"][0].get("labels").is_none());
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::sync::Arc;
        use std::thread;

        let recorder = Arc::new(MetricsRecorder::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let r = recorder.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    r.counter_inc("concurrent.test", &[], 1);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(recorder.counter_get("concurrent.test", &[]), 10_000);
    }
}
