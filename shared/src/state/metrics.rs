use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for detached mirror writes.
#[derive(Debug, Default)]
pub struct MirrorMetrics {
    pub issued: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    /// Writes dropped because the container runs without a store.
    pub skipped: AtomicU64,
    pub handles_created: AtomicU64,
    pub handles_released: AtomicU64,
}

impl MirrorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MirrorMetricsSnapshot {
        MirrorMetricsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_released: self.handles_released.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorMetricsSnapshot {
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub handles_created: u64,
    pub handles_released: u64,
}

impl MirrorMetricsSnapshot {
    pub fn in_flight(&self) -> u64 {
        self.issued
            .saturating_sub(self.succeeded)
            .saturating_sub(self.failed)
    }

    pub fn live_handles(&self) -> u64 {
        self.handles_created.saturating_sub(self.handles_released)
    }
}
