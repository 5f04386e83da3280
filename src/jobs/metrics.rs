//! Job execution counters

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct JobMetrics {
    /// Jobs whose business command committed
    pub jobs_succeeded: AtomicU64,
    /// Failed attempts recorded by the failure listener
    pub jobs_failed: AtomicU64,
    /// Failures that brought a job to zero retries
    pub jobs_exhausted: AtomicU64,
    /// Optimistic locking conflicts seen by the failure listener
    pub listener_conflicts: AtomicU64,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, exhausted: bool) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        if exhausted {
            self.jobs_exhausted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_listener_conflict(&self) {
        self.listener_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> JobMetricsSnapshot {
        JobMetricsSnapshot {
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_exhausted: self.jobs_exhausted.load(Ordering::Relaxed),
            listener_conflicts: self.listener_conflicts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobMetricsSnapshot {
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_exhausted: u64,
    pub listener_conflicts: u64,
}
