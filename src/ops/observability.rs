//! Metrics.
//!
//! Metric namespaces:
//! - stratum.update.*   — update operation counters
//! - stratum.latency.*  — sub-operation latency histograms
//! - stratum.stripe.*   — stripe runtime gauges
//!
//! The registry keeps all metric families behind one `RwLock` of sorted
//! maps. Samples come from stripe threads at operation granularity, so a
//! short write lock per sample costs less than per-metric atomics would,
//! and the sorted maps give a stable export order for free.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

/// Metric names.
pub mod metrics {
    /// Updates that began on the fast path.
    pub const UPDATE_FAST_PATH_TOTAL: &str = "stratum.update.fast_path_total";
    /// Updates that began on the slow path.
    pub const UPDATE_SLOW_PATH_TOTAL: &str = "stratum.update.slow_path_total";
    /// Slow-path operations restarted onto the fast path from consistent
    /// metadata.
    pub const UPDATE_FAST_PATH_RESTARTS_TOTAL: &str = "stratum.update.fast_path_restarts_total";
    /// Replies with test-and-set failure.
    pub const UPDATE_TAS_FAILURES_TOTAL: &str = "stratum.update.tas_failures_total";
    /// Replies with transient ownership change.
    pub const UPDATE_OWNERSHIP_CHANGES_TOTAL: &str = "stratum.update.ownership_changes_total";
    /// Fast-path direct update fan-out latency (ms).
    pub const LATENCY_UPDATE_MS: &str = "stratum.latency.update_ms";
    /// Metadata-get round latency (ms).
    pub const LATENCY_METADATA_GET_MS: &str = "stratum.latency.metadata_get_ms";
    /// Single full-get latency (ms).
    pub const LATENCY_SINGLE_GET_MS: &str = "stratum.latency.single_get_ms";
    /// Put fan-out latency (ms).
    pub const LATENCY_PUT_MS: &str = "stratum.latency.put_ms";
    /// Operations currently in flight on the stripe.
    pub const STRIPE_ACTIVE_OPERATIONS: &str = "stratum.stripe.active_operations";
}

/// All metric families, keyed by dotted name.
#[derive(Debug, Default)]
struct MetricFamilies {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, u64>,
    histograms: BTreeMap<String, Histogram>,
}

/// Running aggregate of one histogram.
#[derive(Debug, Clone, Copy, Default)]
struct Histogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    fn snapshot(self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
        }
    }
}

/// Histogram snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
    /// Minimum value observed.
    pub min: f64,
    /// Maximum value observed.
    pub max: f64,
}

/// Metrics registry: counters, gauges and histograms by dotted name.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    families: RwLock<MetricFamilies>,
}

impl MetricsRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, value: u64) {
        let mut families = self.families.write();
        *families.counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Get counter value. Unknown counters read as zero.
    pub fn counter_get(&self, name: &str) -> u64 {
        self.families
            .read()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Set a gauge value.
    pub fn gauge_set(&self, name: &str, value: u64) {
        self.families
            .write()
            .gauges
            .insert(name.to_string(), value);
    }

    /// Get gauge value. Unknown gauges read as zero.
    pub fn gauge_get(&self, name: &str) -> u64 {
        self.families.read().gauges.get(name).copied().unwrap_or(0)
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, value: f64) {
        self.families
            .write()
            .histograms
            .entry(name.to_string())
            .or_default()
            .observe(value);
    }

    /// Get histogram data, if any observation was recorded.
    pub fn histogram_get(&self, name: &str) -> Option<HistogramSnapshot> {
        self.families
            .read()
            .histograms
            .get(name)
            .map(|h| h.snapshot())
    }

    /// Export metrics in Prometheus text format, sorted by metric name.
    pub fn export_prometheus(&self) -> String {
        fn flat(name: &str) -> String {
            name.replace('.', "_")
        }
        let families = self.families.read();
        let mut out = String::new();
        for (name, value) in &families.counters {
            let name = flat(name);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }
        for (name, value) in &families.gauges {
            let name = flat(name);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }
        for (name, histogram) in &families.histograms {
            let name = flat(name);
            let _ = writeln!(out, "# TYPE {} histogram", name);
            let _ = writeln!(out, "{}_count {}", name, histogram.count);
            let _ = writeln!(out, "{}_sum {}", name, histogram.sum);
        }
        out
    }
}

/// Update-operation sampling points over a shared registry.
#[derive(Debug, Clone)]
pub struct UpdateMetrics {
    registry: Arc<MetricsRegistry>,
}

impl UpdateMetrics {
    /// Wrap a registry.
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    /// The shared registry.
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// An update began on the fast path.
    pub fn note_fast_path(&self) {
        self.registry.counter_inc(metrics::UPDATE_FAST_PATH_TOTAL);
    }

    /// An update began on the slow path.
    pub fn note_slow_path(&self) {
        self.registry.counter_inc(metrics::UPDATE_SLOW_PATH_TOTAL);
    }

    /// A slow-path update restarted onto the fast path.
    pub fn note_fast_path_restart(&self) {
        self.registry
            .counter_inc(metrics::UPDATE_FAST_PATH_RESTARTS_TOTAL);
    }

    /// A reply carried test-and-set failure.
    pub fn note_tas_failure(&self) {
        self.registry.counter_inc(metrics::UPDATE_TAS_FAILURES_TOTAL);
    }

    /// A reply carried a transient ownership change.
    pub fn note_ownership_change(&self) {
        self.registry
            .counter_inc(metrics::UPDATE_OWNERSHIP_CHANGES_TOTAL);
    }

    /// Record fan-out latency for the direct-update round.
    pub fn observe_update_latency(&self, since: Instant) {
        self.observe(metrics::LATENCY_UPDATE_MS, since);
    }

    /// Record metadata-get round latency.
    pub fn observe_metadata_get_latency(&self, since: Instant) {
        self.observe(metrics::LATENCY_METADATA_GET_MS, since);
    }

    /// Record single full-get latency.
    pub fn observe_single_get_latency(&self, since: Instant) {
        self.observe(metrics::LATENCY_SINGLE_GET_MS, since);
    }

    /// Record put fan-out latency.
    pub fn observe_put_latency(&self, since: Instant) {
        self.observe(metrics::LATENCY_PUT_MS, since);
    }

    fn observe(&self, name: &str, since: Instant) {
        self.registry
            .histogram_observe(name, since.elapsed().as_secs_f64() * 1000.0);
    }
}

impl Default for UpdateMetrics {
    fn default() -> Self {
        Self::new(Arc::new(MetricsRegistry::new()))
    }
}
