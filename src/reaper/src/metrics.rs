//! Reaper Metrics
//!
//! Thread-safe counters for deletion and garbage collection runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Thread-safe metrics shared by every operation of one [`crate::Reaper`]
#[derive(Debug, Clone, Default)]
pub struct ReaperMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Datasets whose namespace was fully removed
    datasets_deleted: AtomicUsize,
    /// Completed garbage collection runs
    gc_runs: AtomicUsize,
    /// Keys removed by dataset deletion
    keys_deleted: AtomicUsize,
    /// Orphan keys removed by garbage collection
    orphans_deleted: AtomicUsize,
    /// Operations that ended in a partial failure
    partial_failures: AtomicUsize,
    /// Keys still present after a successful delete call
    inconsistencies: AtomicUsize,
    /// Total duration in milliseconds
    total_duration_ms: AtomicU64,
}

/// Point-in-time copy of [`ReaperMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSummary {
    pub datasets_deleted: usize,
    pub gc_runs: usize,
    pub keys_deleted: usize,
    pub orphans_deleted: usize,
    pub partial_failures: usize,
    pub inconsistencies: usize,
    pub total_duration_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        tracing::info!(
            datasets_deleted = self.datasets_deleted,
            gc_runs = self.gc_runs,
            keys_deleted = self.keys_deleted,
            orphans_deleted = self.orphans_deleted,
            partial_failures = self.partial_failures,
            inconsistencies = self.inconsistencies,
            total_duration_ms = self.total_duration_ms,
            "Reaper metrics summary"
        );
    }
}

impl ReaperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dataset_deleted(&self, keys: usize) {
        self.inner.datasets_deleted.fetch_add(1, Ordering::Relaxed);
        self.inner.keys_deleted.fetch_add(keys, Ordering::Relaxed);
    }

    pub fn record_gc_run(&self, orphans: usize) {
        self.inner.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.inner
            .orphans_deleted
            .fetch_add(orphans, Ordering::Relaxed);
    }

    pub fn record_partial_failure(&self, inconsistencies: usize) {
        self.inner.partial_failures.fetch_add(1, Ordering::Relaxed);
        self.inner
            .inconsistencies
            .fetch_add(inconsistencies, Ordering::Relaxed);
    }

    pub fn record_duration(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.inner
            .total_duration_ms
            .fetch_add(ms, Ordering::Relaxed);
    }

    pub fn datasets_deleted(&self) -> usize {
        self.inner.datasets_deleted.load(Ordering::Relaxed)
    }

    pub fn gc_runs(&self) -> usize {
        self.inner.gc_runs.load(Ordering::Relaxed)
    }

    pub fn keys_deleted(&self) -> usize {
        self.inner.keys_deleted.load(Ordering::Relaxed)
    }

    pub fn orphans_deleted(&self) -> usize {
        self.inner.orphans_deleted.load(Ordering::Relaxed)
    }

    pub fn partial_failures(&self) -> usize {
        self.inner.partial_failures.load(Ordering::Relaxed)
    }

    pub fn inconsistencies(&self) -> usize {
        self.inner.inconsistencies.load(Ordering::Relaxed)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.inner.total_duration_ms.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            datasets_deleted: self.datasets_deleted(),
            gc_runs: self.gc_runs(),
            keys_deleted: self.keys_deleted(),
            orphans_deleted: self.orphans_deleted(),
            partial_failures: self.partial_failures(),
            inconsistencies: self.inconsistencies(),
            total_duration_ms: self.total_duration_ms(),
        }
    }
}
