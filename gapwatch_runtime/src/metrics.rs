//! Runtime metrics for batches, records, reports and backfill streaming.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

/// Kind of metric being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Batch handed to a worker
    BatchReceived,
    /// Record applied to the gap store
    RecordApplied,
    /// Record released for redelivery
    RecordFailed,
    /// Transaction retried after a conflict
    ConflictRetried,
    /// Report written
    ReportWritten,
    /// Report that could not be produced
    ReportFailed,
    /// Backfill unit sent to the backfill queue
    BackfillUnitSent,
    /// Backfill job finished
    BackfillJobFinished,
}

const KINDS: usize = 8;

/// Runtime metrics collector.
///
/// Cheap to clone; all clones update the same counters.
#[derive(Clone, Debug)]
pub struct RuntimeMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    counts: [AtomicU64; KINDS],
    /// Time spent applying batches (nanoseconds)
    apply_time_ns: AtomicU64,
}

impl RuntimeMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                counts: std::array::from_fn(|_| AtomicU64::new(0)),
                apply_time_ns: AtomicU64::new(0),
            }),
        }
    }

    /// Records one occurrence.
    pub fn record(&self, kind: MetricKind) {
        self.add(kind, 1);
    }

    /// Records `n` occurrences.
    pub fn add(&self, kind: MetricKind, n: u64) {
        self.inner.counts[kind as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Records the time spent applying one batch.
    pub fn record_apply_time(&self, duration: Duration) {
        self.inner
            .apply_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Gets the count for a specific metric.
    pub fn count(&self, kind: MetricKind) -> u64 {
        self.inner.counts[kind as usize].load(Ordering::Relaxed)
    }

    /// Gets the total batch apply time.
    pub fn apply_time(&self) -> Duration {
        Duration::from_nanos(self.inner.apply_time_ns.load(Ordering::Relaxed))
    }

    /// Gets all metrics as a summary.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            batches: self.count(MetricKind::BatchReceived),
            records_applied: self.count(MetricKind::RecordApplied),
            records_failed: self.count(MetricKind::RecordFailed),
            conflicts_retried: self.count(MetricKind::ConflictRetried),
            reports_written: self.count(MetricKind::ReportWritten),
            reports_failed: self.count(MetricKind::ReportFailed),
            backfill_units_sent: self.count(MetricKind::BackfillUnitSent),
            backfill_jobs_finished: self.count(MetricKind::BackfillJobFinished),
            apply_time_ms: self.apply_time().as_millis() as u64,
        }
    }

    /// Resets all metrics to zero.
    pub fn reset(&self) {
        for count in &self.inner.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.inner.apply_time_ns.store(0, Ordering::Relaxed);
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of runtime metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    /// Batches handed to workers
    pub batches: u64,
    /// Records applied
    pub records_applied: u64,
    /// Records released for redelivery
    pub records_failed: u64,
    /// Conflicting transactions retried
    pub conflicts_retried: u64,
    /// Reports written
    pub reports_written: u64,
    /// Reports that failed
    pub reports_failed: u64,
    /// Backfill units streamed
    pub backfill_units_sent: u64,
    /// Backfill jobs finished
    pub backfill_jobs_finished: u64,
    /// Total time spent applying batches
    pub apply_time_ms: u64,
}
