use std::sync::atomic::{AtomicU64, Ordering};

use crate::scheduler::DropReason;

/// Counters of one shaping engine. These are shared between the dispatch loop
/// and whoever attached it.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Frames read from the interception point.
    received: AtomicU64,
    /// Frames written back to the wire, shaped or not.
    forwarded: AtomicU64,
    /// Frames without a table entry, forwarded untouched.
    bypassed: AtomicU64,
    /// Frames queued with the CE codepoint newly set.
    ecn_marked: AtomicU64,
    dropped_loss: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_horizon: AtomicU64,
    /// Frames too short to carry an Ethernet header.
    dropped_malformed: AtomicU64,
    /// Frames still queued when the drain deadline passed.
    dropped_shutdown: AtomicU64,
    send_errors: AtomicU64,
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub bypassed: u64,
    pub ecn_marked: u64,
    pub dropped_loss: u64,
    pub dropped_queue_full: u64,
    pub dropped_horizon: u64,
    pub dropped_malformed: u64,
    pub dropped_shutdown: u64,
    pub send_errors: u64,
}

impl EngineStatsSnapshot {
    /// Total frames dropped for any reason.
    pub fn dropped(&self) -> u64 {
        self.dropped_loss
            + self.dropped_queue_full
            + self.dropped_horizon
            + self.dropped_malformed
            + self.dropped_shutdown
    }
}

impl EngineStats {
    #[inline]
    pub(crate) fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_ecn_marked(&self) {
        self.ecn_marked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Loss => &self.dropped_loss,
            DropReason::QueueFull => &self.dropped_queue_full,
            DropReason::Horizon => &self.dropped_horizon,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_malformed(&self) {
        self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_dropped_shutdown(&self, n: u64) {
        self.dropped_shutdown.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_send_errors(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bypassed(&self) -> u64 {
        self.bypassed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            ecn_marked: self.ecn_marked.load(Ordering::Relaxed),
            dropped_loss: self.dropped_loss.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_horizon: self.dropped_horizon.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_shutdown: self.dropped_shutdown.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}
