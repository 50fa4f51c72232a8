//! Operation metrics tracking.
//!
//! Every entity keeps one [`EntityMetrics`] with a counter set per
//! [`OperationKind`]. The operation controller records the latency of each
//! native call from issue to completion, and every caller timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::OperationKind;

/// Snapshot of the metrics of one operation kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    /// Total number of completed native calls.
    pub count: u64,
    /// Number of successful native calls.
    pub success_count: u64,
    /// Number of failed native calls.
    pub failure_count: u64,
    /// Number of callers released by a timeout.
    pub timeout_count: u64,
    /// Number of completions that arrived with no caller waiting.
    pub orphan_count: u64,
    /// Total duration of all completed calls.
    pub total_duration_ms: u64,
    /// Minimum call duration.
    pub min_duration_ms: Option<u64>,
    /// Maximum call duration.
    pub max_duration_ms: Option<u64>,
    /// Average call duration.
    pub avg_duration_ms: Option<f64>,
}

impl OperationMetrics {
    /// Fraction of completed calls that succeeded, if any completed.
    pub fn success_rate(&self) -> Option<f64> {
        (self.count > 0).then(|| self.success_count as f64 / self.count as f64)
    }
}

/// Thread-safe atomic operation metrics tracker.
#[derive(Debug)]
pub struct AtomicOperationMetrics {
    count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    timeout_count: AtomicU64,
    orphan_count: AtomicU64,
    total_duration_ms: AtomicU64,
    min_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

impl Default for AtomicOperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicOperationMetrics {
    /// Create new empty metrics.
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            orphan_count: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            min_duration_ms: AtomicU64::new(u64::MAX),
            max_duration_ms: AtomicU64::new(0),
        }
    }

    /// Record a completed native call.
    pub fn record(&self, success: bool, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_duration_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_duration_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Record a caller released by its timeout.
    pub fn record_timeout(&self) {
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion with no pending handle.
    pub fn record_orphan(&self) {
        self.orphan_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current metrics.
    pub fn snapshot(&self) -> OperationMetrics {
        let count = self.count.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);
        let min = self.min_duration_ms.load(Ordering::Relaxed);

        OperationMetrics {
            count,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            orphan_count: self.orphan_count.load(Ordering::Relaxed),
            total_duration_ms,
            min_duration_ms: (min != u64::MAX).then_some(min),
            max_duration_ms: (count > 0).then(|| self.max_duration_ms.load(Ordering::Relaxed)),
            avg_duration_ms: (count > 0).then(|| total_duration_ms as f64 / count as f64),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.timeout_count.store(0, Ordering::Relaxed);
        self.orphan_count.store(0, Ordering::Relaxed);
        self.total_duration_ms.store(0, Ordering::Relaxed);
        self.min_duration_ms.store(u64::MAX, Ordering::Relaxed);
        self.max_duration_ms.store(0, Ordering::Relaxed);
    }
}

/// Metrics of every operation kind of one entity, plus transferred bytes.
#[derive(Debug, Default)]
pub struct EntityMetrics {
    operations: [AtomicOperationMetrics; OperationKind::COUNT],
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl EntityMetrics {
    /// Create new empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters of one operation kind.
    pub fn operation(&self, kind: OperationKind) -> &AtomicOperationMetrics {
        &self.operations[kind.index()]
    }

    /// Record bytes received from the device.
    pub fn record_bytes_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record bytes sent to the device.
    pub fn record_bytes_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get total bytes read.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Get total bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Snapshot of every operation kind that ran at least once.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            operations: OperationKind::ALL
                .iter()
                .map(|kind| (*kind, self.operation(*kind).snapshot()))
                .filter(|(_, m)| m.count > 0 || m.timeout_count > 0 || m.orphan_count > 0)
                .collect(),
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        for ops in &self.operations {
            ops.reset();
        }
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}

/// Serializable summary of [`EntityMetrics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Per-operation snapshots.
    pub operations: Vec<(OperationKind, OperationMetrics)>,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
}

impl MetricsSummary {
    /// Snapshot of one operation kind.
    pub fn get(&self, kind: OperationKind) -> Option<&OperationMetrics> {
        self.operations
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, m)| m)
    }
}
