//! Internal metrics collection.
//!
//! Counters are process-wide and lock-free; the scheduler logs a snapshot
//! periodically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 10ms, 100ms, 500ms, 1s, 5s, 10s, 1m, 5m, 15m, 1h
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [
        1, 10, 100, 500, 1_000, 5_000, 10_000, 60_000, 300_000, 900_000, 3_600_000,
    ];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets, add to last
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the backup pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    // Organization scanner
    pub projects_listed: Counter,
    pub projects_published: Counter,

    // Staleness checker
    pub datasets_listed: Counter,
    pub tables_checked: Counter,
    pub tables_due: Counter,
    pub enumeration_errors: Counter,
    pub metadata_errors: Counter,

    // Backup executor
    pub exports_started: Counter,
    pub exports_succeeded: Counter,
    pub exports_failed: Counter,
    pub exports_timed_out: Counter,

    // Bus
    pub messages_published: Counter,
    pub publish_errors: Counter,
    pub messages_consumed: Counter,
    pub messages_acked: Counter,
    pub messages_redelivered: Counter,
    pub messages_poisoned: Counter,
    pub messages_dead_lettered: Counter,

    // Latency histograms
    pub publish_latency_ms: Histogram,
    pub export_latency_ms: Histogram,
    pub project_check_latency_ms: Histogram,

    // Gauges
    pub handlers_in_flight: Gauge,
    pub consumer_lag: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub projects_listed: u64,
    pub projects_published: u64,
    pub datasets_listed: u64,
    pub tables_checked: u64,
    pub tables_due: u64,
    pub enumeration_errors: u64,
    pub metadata_errors: u64,
    pub exports_started: u64,
    pub exports_succeeded: u64,
    pub exports_failed: u64,
    pub exports_timed_out: u64,
    pub messages_published: u64,
    pub publish_errors: u64,
    pub messages_consumed: u64,
    pub messages_acked: u64,
    pub messages_redelivered: u64,
    pub messages_poisoned: u64,
    pub messages_dead_lettered: u64,
    pub publish_latency_mean_ms: f64,
    pub export_latency_mean_ms: f64,
    pub project_check_latency_mean_ms: f64,
    pub handlers_in_flight: u64,
    pub consumer_lag: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            projects_listed: self.projects_listed.get(),
            projects_published: self.projects_published.get(),
            datasets_listed: self.datasets_listed.get(),
            tables_checked: self.tables_checked.get(),
            tables_due: self.tables_due.get(),
            enumeration_errors: self.enumeration_errors.get(),
            metadata_errors: self.metadata_errors.get(),
            exports_started: self.exports_started.get(),
            exports_succeeded: self.exports_succeeded.get(),
            exports_failed: self.exports_failed.get(),
            exports_timed_out: self.exports_timed_out.get(),
            messages_published: self.messages_published.get(),
            publish_errors: self.publish_errors.get(),
            messages_consumed: self.messages_consumed.get(),
            messages_acked: self.messages_acked.get(),
            messages_redelivered: self.messages_redelivered.get(),
            messages_poisoned: self.messages_poisoned.get(),
            messages_dead_lettered: self.messages_dead_lettered.get(),
            publish_latency_mean_ms: self.publish_latency_ms.mean(),
            export_latency_mean_ms: self.export_latency_ms.mean(),
            project_check_latency_mean_ms: self.project_check_latency_ms.mean(),
            handlers_in_flight: self.handlers_in_flight.get(),
            consumer_lag: self.consumer_lag.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
