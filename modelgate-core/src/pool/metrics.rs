//! Per-pool admission metrics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one admission pool.
///
/// `queued` counts callers waiting for a slot, `processing` counts
/// outstanding admission tokens. The `dirty` flag marks unreported changes
/// for the reporter task.
#[derive(Debug)]
pub struct PoolMetrics {
    model: String,
    queued: AtomicU64,
    processing: AtomicU64,
    dirty: AtomicBool,
}

/// Snapshot of a pool's counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queued: u64,
    pub processing: u64,
}

impl PoolMetrics {
    pub(crate) fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            queued: AtomicU64::new(0),
            processing: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Model name these counters belong to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Current number of waiters.
    pub fn queue_depth(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Current number of outstanding tokens.
    pub fn processing_count(&self) -> u64 {
        self.processing.load(Ordering::Relaxed)
    }

    /// Get a snapshot of both counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queued: self.queue_depth(),
            processing: self.processing_count(),
        }
    }

    /// Register a waiter. The guard deregisters on drop; a wait that ends in
    /// admission consumes it via [`QueueGuard::admit`] instead.
    pub(crate) fn enter_queue(metrics: &Arc<Self>) -> QueueGuard {
        metrics.queued.fetch_add(1, Ordering::Relaxed);
        metrics.mark_dirty();
        QueueGuard { metrics: Arc::clone(metrics) }
    }

    /// An admission token was released.
    pub(crate) fn finish_processing(&self) {
        self.processing.fetch_sub(1, Ordering::Relaxed);
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag and return a snapshot, or `None` if nothing
    /// changed since the last call. A change racing with the snapshot sets
    /// the flag again and is picked up on the next poll.
    pub(crate) fn take_dirty(&self) -> Option<MetricsSnapshot> {
        if !self.dirty.swap(false, Ordering::Acquire) {
            return None;
        }
        Some(self.snapshot())
    }
}

/// Membership in a pool's wait queue, tied to the lifetime of the acquire
/// call so an abandoned wait can never leak the waiter count.
#[derive(Debug)]
pub(crate) struct QueueGuard {
    metrics: Arc<PoolMetrics>,
}

impl QueueGuard {
    /// The wait ended in admission: move this caller from `queued` to
    /// `processing`.
    pub(crate) fn admit(self) {
        self.metrics.processing.fetch_add(1, Ordering::Relaxed);
        // Drop decrements `queued` and marks dirty.
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.metrics.queued.fetch_sub(1, Ordering::Relaxed);
        self.metrics.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_guard_deregisters_on_drop() {
        let metrics = Arc::new(PoolMetrics::new("m"));

        let guard = PoolMetrics::enter_queue(&metrics);
        assert_eq!(metrics.queue_depth(), 1);
        assert_eq!(metrics.processing_count(), 0);

        drop(guard);
        assert_eq!(metrics.queue_depth(), 0);
        assert_eq!(metrics.processing_count(), 0);
    }

    #[test]
    fn admit_moves_waiter_to_processing() {
        let metrics = Arc::new(PoolMetrics::new("m"));

        let guard = PoolMetrics::enter_queue(&metrics);
        guard.admit();
        assert_eq!(metrics.queue_depth(), 0);
        assert_eq!(metrics.processing_count(), 1);

        metrics.finish_processing();
        assert_eq!(metrics.processing_count(), 0);
    }

    #[test]
    fn take_dirty_reports_each_change_once() {
        let metrics = Arc::new(PoolMetrics::new("m"));
        assert_eq!(metrics.take_dirty(), None);

        PoolMetrics::enter_queue(&metrics).admit();
        let snapshot = metrics.take_dirty().expect("change pending");
        assert_eq!(snapshot, MetricsSnapshot { queued: 0, processing: 1 });

        // Nothing changed since the last call.
        assert_eq!(metrics.take_dirty(), None);

        metrics.finish_processing();
        let snapshot = metrics.take_dirty().expect("change pending");
        assert_eq!(snapshot, MetricsSnapshot { queued: 0, processing: 0 });
    }
}
