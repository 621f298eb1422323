//! Named master metrics counters. Exporting is left to the embedder; the
//! counters themselves are part of the control plane's contract.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Duration;

/// Master metrics counters. All methods are cheap and lock-free.
#[derive(Debug, Default)]
pub struct MasterMetrics {
    /// Completed log-split recoveries.
    splits_completed: AtomicU64,

    /// Total wall time spent splitting logs.
    split_duration_ms_total: AtomicU64,

    /// Total log files processed by splits.
    split_files_total: AtomicU64,

    /// Total log bytes processed by splits.
    split_bytes_total: AtomicU64,

    /// Open-region directives issued.
    regions_assigned_total: AtomicU64,

    /// Directives considered lost after the assignment timeout.
    directives_lost_total: AtomicU64,

    /// Operations requeued after transient failures.
    queue_requeues_total: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub splits_completed: u64,
    pub split_duration_ms_total: u64,
    pub split_files_total: u64,
    pub split_bytes_total: u64,
    pub regions_assigned_total: u64,
    pub directives_lost_total: u64,
    pub queue_requeues_total: u64,
}

impl MasterMetrics {
    /// Records one completed log split.
    pub fn add_split(&self, duration: Duration, files: u64, bytes: u64) {
        self.splits_completed.fetch_add(1, Ordering::Relaxed);
        self.split_duration_ms_total
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.split_files_total.fetch_add(files, Ordering::Relaxed);
        self.split_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one issued open-region directive.
    pub fn incr_assigned(&self) {
        self.regions_assigned_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one lost directive.
    pub fn incr_directive_lost(&self) {
        self.directives_lost_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one requeued operation.
    pub fn incr_requeue(&self) {
        self.queue_requeues_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies out all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            splits_completed: self.splits_completed.load(Ordering::Relaxed),
            split_duration_ms_total: self
                .split_duration_ms_total
                .load(Ordering::Relaxed),
            split_files_total: self
                .split_files_total
                .load(Ordering::Relaxed),
            split_bytes_total: self
                .split_bytes_total
                .load(Ordering::Relaxed),
            regions_assigned_total: self
                .regions_assigned_total
                .load(Ordering::Relaxed),
            directives_lost_total: self
                .directives_lost_total
                .load(Ordering::Relaxed),
            queue_requeues_total: self
                .queue_requeues_total
                .load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod metrics_tests {
    use super::*;

    #[test]
    fn split_accounting() {
        let metrics = MasterMetrics::default();
        metrics.add_split(Duration::from_millis(120), 5, 4096);
        metrics.add_split(Duration::from_millis(80), 2, 1024);
        let snap = metrics.snapshot();
        assert_eq!(snap.splits_completed, 2);
        assert_eq!(snap.split_duration_ms_total, 200);
        assert_eq!(snap.split_files_total, 7);
        assert_eq!(snap.split_bytes_total, 5120);
    }
}
