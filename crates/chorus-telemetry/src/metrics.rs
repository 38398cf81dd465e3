use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Metric names recorded by the relay.
pub mod names {
    pub const CONNECTIONS_ACTIVE: &str = "ws.connections.active";
    pub const CONNECTIONS_TOTAL: &str = "ws.connections.total";
    pub const MESSAGES_RECEIVED: &str = "relay.messages.received";
    pub const MESSAGES_REJECTED: &str = "relay.messages.rejected";
    pub const TURNS_TOTAL: &str = "relay.turns.total";
    pub const TURN_DURATION_MS: &str = "relay.turn.duration_ms";
    pub const CHUNKS_SENT: &str = "relay.chunks.sent";
    pub const PROVIDER_ERRORS: &str = "llm.errors.total";
    pub const SESSIONS_ACTIVE: &str = "sessions.active";
    pub const SESSIONS_EVICTED: &str = "sessions.evicted";
}

/// Observations kept per histogram. Older values fall off the front.
const HISTOGRAM_WINDOW: usize = 4096;

struct Counter(AtomicU64);

impl Counter {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge stored as raw `f64` bits so it can be updated lock-free.
struct Gauge(AtomicU64);

impl Gauge {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Sliding window of recent observations plus lifetime totals.
struct Histogram {
    inner: Mutex<HistogramInner>,
}

#[derive(Default)]
struct HistogramInner {
    window: VecDeque<f64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HistogramInner::default()),
        }
    }

    fn observe(&self, value: f64) {
        let mut inner = self.inner.lock();
        if inner.window.len() == HISTOGRAM_WINDOW {
            inner.window.pop_front();
        }
        inner.window.push_back(value);
        inner.count += 1;
        inner.sum += value;
    }

    fn summary(&self) -> HistogramSummary {
        let inner = self.inner.lock();
        if inner.window.is_empty() {
            return HistogramSummary::default();
        }
        let mut sorted: Vec<f64> = inner.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: inner.count,
            sum: inner.sum,
            p50: at(0.5),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Summary statistics from a histogram. Percentiles cover the recent window;
/// `count` and `sum` cover the process lifetime.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// One labelled series in a [`MetricsSnapshot`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint<V> {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub value: V,
}

/// Point-in-time view of every recorded metric, served by `GET /metrics`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub counters: Vec<MetricPoint<u64>>,
    pub gauges: Vec<MetricPoint<f64>>,
    pub histograms: Vec<MetricPoint<HistogramSummary>>,
}

/// Thread-safe in-process metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("counters", &self.counters.read().len())
            .field("gauges", &self.gauges.read().len())
            .field("histograms", &self.histograms.read().len())
            .finish()
    }
}

/// Look up `key`, creating the series on first use. Reads take the shared
/// lock; only a brand-new series takes the write lock.
fn with_series<T, R>(
    map: &RwLock<HashMap<MetricKey, T>>,
    key: MetricKey,
    make: fn() -> T,
    f: impl FnOnce(&T) -> R,
) -> R {
    {
        let read = map.read();
        if let Some(series) = read.get(&key) {
            return f(series);
        }
    }
    let mut write = map.write();
    f(write.entry(key).or_insert_with(make))
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_series(&self.counters, MetricKey::new(name, labels), Counter::new, |c| c.add(n));
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| g.set(value));
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(&self.histograms, MetricKey::new(name, labels), Histogram::new, |h| {
            h.observe(value)
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Capture every series, sorted by name then labels.
    pub fn snapshot(&self) -> MetricsSnapshot {
        fn collect<T, V>(
            map: &RwLock<HashMap<MetricKey, T>>,
            value: impl Fn(&T) -> V,
        ) -> Vec<MetricPoint<V>> {
            let map = map.read();
            let mut keys: Vec<&MetricKey> = map.keys().collect();
            keys.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
            keys.into_iter()
                .map(|key| MetricPoint {
                    name: key.name.clone(),
                    labels: key.label_map(),
                    value: value(&map[key]),
                })
                .collect()
        }

        MetricsSnapshot {
            taken_at: Utc::now(),
            counters: collect(&self.counters, Counter::get),
            gauges: collect(&self.gauges, Gauge::get),
            histograms: collect(&self.histograms, Histogram::summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::TURNS_TOTAL, &[("agent", "story_master")], 1);
        recorder.counter_inc(names::TURNS_TOTAL, &[("agent", "story_master")], 1);
        recorder.counter_inc(names::TURNS_TOTAL, &[("agent", "food_critic")], 1);

        assert_eq!(recorder.counter_get(names::TURNS_TOTAL, &[("agent", "story_master")]), 2);
        assert_eq!(recorder.counter_get(names::TURNS_TOTAL, &[("agent", "food_critic")]), 1);
        assert_eq!(recorder.counter_get(names::TURNS_TOTAL, &[("agent", "nobody")]), 0);
    }

    #[test]
    fn gauge_set_overwrites() {
        let recorder = MetricsRecorder::new();
        assert_eq!(recorder.gauge_get(names::CONNECTIONS_ACTIVE, &[]), 0.0);
        recorder.gauge_set(names::CONNECTIONS_ACTIVE, &[], 10.0);
        recorder.gauge_set(names::CONNECTIONS_ACTIVE, &[], 2.5);
        assert_eq!(recorder.gauge_get(names::CONNECTIONS_ACTIVE, &[]), 2.5);
    }

    #[test]
    fn histogram_observations() {
        let recorder = MetricsRecorder::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            recorder.histogram_observe(names::TURN_DURATION_MS, &[], v);
        }
        let summary = recorder.histogram_summary(names::TURN_DURATION_MS, &[]);
        assert_eq!(summary.count, 10);
        assert_eq!(summary.sum, 550.0);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 60.0);
        assert!(summary.p95 >= 90.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for _ in 0..HISTOGRAM_WINDOW {
            recorder.histogram_observe("h", &[], 1000.0);
        }
        for _ in 0..HISTOGRAM_WINDOW {
            recorder.histogram_observe("h", &[], 1.0);
        }
        let summary = recorder.histogram_summary("h", &[]);
        assert_eq!(summary.count, (HISTOGRAM_WINDOW * 2) as u64);
        // the old observations have left the percentile window
        assert_eq!(summary.p99, 1.0);
    }

    #[test]
    fn histogram_empty() {
        let recorder = MetricsRecorder::new();
        assert_eq!(recorder.histogram_summary("missing", &[]), HistogramSummary::default());
    }

    #[test]
    fn label_ordering_independent() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("test", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("test", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("test", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn snapshot_contains_every_series() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::CHUNKS_SENT, &[("agent", "b")], 3);
        recorder.counter_inc(names::CHUNKS_SENT, &[("agent", "a")], 1);
        recorder.gauge_set(names::SESSIONS_ACTIVE, &[], 2.0);
        recorder.histogram_observe(names::TURN_DURATION_MS, &[], 12.0);

        let snap = recorder.snapshot();
        assert_eq!(snap.counters.len(), 2);
        assert_eq!(snap.counters[0].labels["agent"], "a");
        assert_eq!(snap.counters[1].value, 3);
        assert_eq!(snap.gauges[0].value, 2.0);
        assert_eq!(snap.histograms[0].value.count, 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("takenAt").is_some());
        assert!(json["gauges"][0].get("labels").is_none());
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::sync::Arc;
        use std::thread;

        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let r = recorder.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("concurrent.test", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("concurrent.test", &[]), 10_000);
    }
}
