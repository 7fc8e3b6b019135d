//! Transfer counters
//!
//! Lock-free counters updated by the transfer engine. A snapshot can be
//! taken at any time for logging or diagnostics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Session-wide transfer counters
#[derive(Debug, Default)]
pub struct TransferStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    bytes_transferred: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    stalled: AtomicU64,
    failed: AtomicU64,
    cancellation_races: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub bytes_transferred: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub stalled: u64,
    pub failed: u64,
    /// Cancellations that arrived after the transfer had already completed
    pub cancellation_races: u64,
}

impl TransferStats {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, bytes: usize) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stalled(&self) {
        self.stalled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation_race(&self) {
        self.cancellation_races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancellation_races: self.cancellation_races.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let stats = TransferStats::default();
        stats.record_submitted();
        stats.record_submitted();
        stats.record_completed(64);
        stats.record_timed_out();
        stats.record_cancellation_race();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.bytes_transferred, 64);
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.cancellation_races, 1);
        assert_eq!(snapshot.failed, 0);
    }
}
