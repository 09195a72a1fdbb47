//! Live counters exposed by the queue engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters maintained by the engine; read-only to callers.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    busy_workers: AtomicU64,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    suspended: AtomicU64,
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    /// Workers currently executing an iteration.
    pub busy_workers: u64,
    /// Tasks accepted by `submit` since start.
    pub submitted: u64,
    /// Tasks that reached `completed`.
    pub succeeded: u64,
    /// Tasks that reached `error`.
    pub failed: u64,
    /// Tasks currently parked in `suspending`.
    pub suspended: u64,
}

impl QueueMetrics {
    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            busy_workers: self.busy_workers.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            suspended: self.suspended.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn worker_busy(&self) {
        self.busy_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_idle(&self) {
        self.busy_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn task_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_suspended(&self) {
        self.suspended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_resumed(&self) {
        self.suspended.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = QueueMetrics::default();
        metrics.task_submitted();
        metrics.task_submitted();
        metrics.task_succeeded();
        metrics.task_suspended();
        metrics.task_resumed();
        metrics.worker_busy();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.suspended, 0);
        assert_eq!(snapshot.busy_workers, 1);
        assert_eq!(snapshot.failed, 0);
    }
}
