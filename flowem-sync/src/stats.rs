use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a [`Synchronizer`](crate::Synchronizer).
#[derive(Debug, Default)]
pub struct SyncStats {
    /// Notifications received from the change feed.
    events: AtomicU64,
    /// Notifications for keys outside the interest filter.
    ignored: AtomicU64,
    /// Upserts that changed the table.
    applied: AtomicU64,
    unchanged: AtomicU64,
    removed: AtomicU64,
    /// Values older than the last one applied for their key.
    stale: AtomicU64,
    /// Records that failed to decode.
    skipped: AtomicU64,
    /// Fetches or upserts that failed for good.
    failed: AtomicU64,
    reconciliations: AtomicU64,
}

/// A point-in-time copy of [`SyncStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub events: u64,
    pub ignored: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub removed: u64,
    pub stale: u64,
    pub skipped: u64,
    pub failed: u64,
    pub reconciliations: u64,
}

impl SyncStats {
    #[inline]
    pub(crate) fn increment_events(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_unchanged(&self) {
        self.unchanged.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_removed(&self, n: u64) {
        self.removed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_reconciliations(&self) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
        }
    }
}
