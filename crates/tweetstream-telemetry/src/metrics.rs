use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Metric names recorded by the relay pipeline.
pub mod names {
    pub const FRAMES_RECEIVED: &str = "relay.frames.received";
    pub const FRAMES_OVERSIZED: &str = "relay.frames.oversized";
    pub const DECODE_ERRORS: &str = "relay.decode_errors";
    pub const MESSAGES_DECODED: &str = "relay.messages.decoded";
    pub const MESSAGES_DELIVERED: &str = "relay.messages.delivered";
    pub const MESSAGES_DROPPED: &str = "relay.messages.dropped";
    pub const HEARTBEATS_SENT: &str = "relay.heartbeats.sent";
    pub const SESSIONS_ACTIVE: &str = "relay.sessions.active";
    pub const SESSIONS_TOTAL: &str = "relay.sessions.total";
    pub const UPSTREAM_OPEN_FAILURES: &str = "relay.upstream.open_failures";
    pub const WRITE_DURATION_MS: &str = "relay.write.duration_ms";
}

/// Type of metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
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
    // f64 bits, so the value can be updated atomically
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0f64.to_bits() as i64),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
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

/// Keep at most this many observations per histogram; older ones are
/// discarded so a long-running relay doesn't grow without bound.
const HISTOGRAM_WINDOW: usize = 4096;

/// In-memory histogram over a sliding window of observations.
struct Histogram {
    observations: Mutex<VecDeque<f64>>,
    total_count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::with_capacity(HISTOGRAM_WINDOW)),
            total_count: AtomicU64::new(0),
        }
    }
    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.pop_front();
        }
        obs.push_back(value);
        self.total_count.fetch_add(1, Ordering::Relaxed);
    }
    fn summary(&self) -> HistogramSummary {
        let mut obs: Vec<f64> = self.observations.lock().iter().copied().collect();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = obs.len();
        let sum: f64 = obs.iter().sum();
        let p50 = obs[count / 2];
        let p95 = obs[((count as f64 * 0.95) as usize).min(count - 1)];
        let p99 = obs[((count as f64 * 0.99) as usize).min(count - 1)];
        HistogramSummary {
            count: self.total_count.load(Ordering::Relaxed),
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

    fn label_map(&self) -> HashMap<String, String> {
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

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.set(value);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        let g = gauges.entry(key).or_insert_with(Gauge::new);
        g.set(value);
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

    /// Get a histogram summary.
    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        histograms
            .get(&key)
            .map(|h| h.summary())
            .unwrap_or_default()
    }

    /// Get current value of a counter.
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, |c| c.get())
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, c)| c.get())
            .sum()
    }

    /// Get current value of a gauge.
    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, |g| g.get())
    }

    /// Current value of every series, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();

        for (key, counter) in self.counters.read().iter() {
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Counter,
                value: counter.get() as f64,
                summary: None,
            });
        }
        for (key, gauge) in self.gauges.read().iter() {
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Gauge,
                value: gauge.get(),
                summary: None,
            });
        }
        for (key, histogram) in self.histograms.read().iter() {
            let summary = histogram.summary();
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Histogram,
                value: summary.p50,
                summary: Some(summary),
            });
        }

        samples.sort_by(|a, b| a.name.cmp(&b.name));
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("messages.decoded", &[("kind", "content")], 1);
        recorder.counter_inc("messages.decoded", &[("kind", "content")], 1);
        recorder.counter_inc("messages.decoded", &[("kind", "warning")], 1);

        assert_eq!(recorder.counter_get("messages.decoded", &[("kind", "content")]), 2);
        assert_eq!(recorder.counter_get("messages.decoded", &[("kind", "warning")]), 1);
        assert_eq!(recorder.counter_get("messages.decoded", &[("kind", "direct")]), 0);
        assert_eq!(recorder.counter_total("messages.decoded"), 3);
    }

    #[test]
    fn gauge_set_and_increment() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set("sessions.active", &[], 10.0);
        assert_eq!(recorder.gauge_get("sessions.active", &[]), 10.0);

        recorder.gauge_inc("sessions.active", &[], 5.0);
        assert_eq!(recorder.gauge_get("sessions.active", &[]), 15.0);

        recorder.gauge_inc("sessions.active", &[], -3.0);
        assert_eq!(recorder.gauge_get("sessions.active", &[]), 12.0);
    }

    #[test]
    fn gauge_starts_at_zero() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("sessions.active", &[], 1.0);
        assert_eq!(recorder.gauge_get("sessions.active", &[]), 1.0);
    }

    #[test]
    fn histogram_observations() {
        let recorder = MetricsRecorder::new();

        for v in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            recorder.histogram_observe("write.duration_ms", &[], v);
        }

        let summary = recorder.histogram_summary("write.duration_ms", &[]);
        assert_eq!(summary.count, 10);
        assert_eq!(summary.sum, 550.0);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 60.0);
        assert!(summary.p95 >= 90.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for v in 0..(HISTOGRAM_WINDOW + 10) {
            recorder.histogram_observe("h", &[], v as f64);
        }
        let summary = recorder.histogram_summary("h", &[]);
        assert_eq!(summary.count, (HISTOGRAM_WINDOW + 10) as u64);
        let expected_sum: f64 = (10..HISTOGRAM_WINDOW + 10).map(|v| v as f64).sum();
        assert_eq!(summary.sum, expected_sum);
    }

    #[test]
    fn histogram_empty() {
        let recorder = MetricsRecorder::new();
        let summary = recorder.histogram_summary("nonexistent", &[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.sum, 0.0);
    }

    #[test]
    fn snapshot_covers_all_series() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::MESSAGES_DROPPED, &[], 4);
        recorder.gauge_set(names::SESSIONS_ACTIVE, &[], 2.0);
        recorder.histogram_observe(names::WRITE_DURATION_MS, &[], 3.0);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.len(), 3);

        let dropped = snapshot
            .iter()
            .find(|s| s.name == names::MESSAGES_DROPPED)
            .unwrap();
        assert_eq!(dropped.value, 4.0);
        assert_eq!(dropped.metric_type, MetricType::Counter);

        let writes = snapshot
            .iter()
            .find(|s| s.name == names::WRITE_DURATION_MS)
            .unwrap();
        assert_eq!(writes.summary.as_ref().unwrap().count, 1);
    }

    #[test]
    fn snapshot_serializes_labels() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::SESSIONS_TOTAL, &[("outcome", "client_disconnected")], 1);
        let json = serde_json::to_value(recorder.snapshot()).unwrap();
        assert_eq!(json[0]["labels"]["outcome"], "client_disconnected");
        assert_eq!(json[0]["metric_type"], "counter");
        assert!(json[0].get("summary").is_none());
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
