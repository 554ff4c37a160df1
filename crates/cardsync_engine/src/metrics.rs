//! Process-wide sync counters.
//!
//! Counters accumulate until [`MetricsRecorder::reset`]. Session durations
//! are kept in a bounded window; the oldest sample is evicted when it is
//! full and `average_sync_time_ms` is computed over what remains.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time copy of the sync counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    /// Operations that reached the remote store, whatever the outcome.
    pub total_operations: u64,
    /// Operations applied by the remote store.
    pub successful_operations: u64,
    /// Failed delivery rounds, dead letters included.
    pub failed_operations: u64,
    /// Mean session duration over the window.
    pub average_sync_time_ms: u64,
    /// Conflicts detected.
    pub conflicts_detected: u64,
    /// Conflicts closed by a policy without user input.
    pub conflicts_auto_resolved: u64,
    /// Operations moved to the dead-letter set.
    pub dead_lettered: u64,
    /// Sessions that completed.
    pub sessions_completed: u64,
    /// Sessions that failed.
    pub sessions_failed: u64,
    /// Approximate bytes sent.
    pub bytes_transferred: u64,
}

/// Thread-safe collector behind [`SyncMetrics`].
#[derive(Debug)]
pub struct MetricsRecorder {
    total_operations: AtomicU64,
    successful_operations: AtomicU64,
    failed_operations: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_auto_resolved: AtomicU64,
    dead_lettered: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    bytes_transferred: AtomicU64,
    durations: Mutex<VecDeque<u64>>,
    window: usize,
}

impl MetricsRecorder {
    /// Creates a recorder averaging over the last `window` sessions.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            total_operations: AtomicU64::new(0),
            successful_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            conflicts_detected: AtomicU64::new(0),
            conflicts_auto_resolved: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            durations: Mutex::new(VecDeque::with_capacity(window)),
            window,
        }
    }

    /// Records operations that were applied.
    pub fn record_succeeded(&self, count: u64) {
        self.total_operations.fetch_add(count, Ordering::Relaxed);
        self.successful_operations
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Records failed delivery rounds.
    pub fn record_failed(&self, count: u64) {
        self.total_operations.fetch_add(count, Ordering::Relaxed);
        self.failed_operations.fetch_add(count, Ordering::Relaxed);
    }

    /// Records dead-lettered operations.
    pub fn record_dead_lettered(&self, count: u64) {
        self.record_failed(count);
        self.dead_lettered.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a detected conflict.
    pub fn record_conflict_detected(&self) {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a conflict closed by a policy.
    pub fn record_auto_resolved(&self) {
        self.conflicts_auto_resolved
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the byte counter.
    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records the end of a session.
    pub fn record_session(&self, duration_ms: u64, completed: bool) {
        if completed {
            self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut durations = self.durations.lock();
        if durations.len() == self.window {
            durations.pop_front();
        }
        durations.push_back(duration_ms);
    }

    /// Returns the current counters.
    pub fn snapshot(&self) -> SyncMetrics {
        let average_sync_time_ms = {
            let durations = self.durations.lock();
            if durations.is_empty() {
                0
            } else {
                durations.iter().sum::<u64>() / durations.len() as u64
            }
        };
        SyncMetrics {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            successful_operations: self.successful_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            average_sync_time_ms,
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_auto_resolved: self.conflicts_auto_resolved.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter and clears the window.
    pub fn reset(&self) {
        for counter in [
            &self.total_operations,
            &self.successful_operations,
            &self.failed_operations,
            &self.conflicts_detected,
            &self.conflicts_auto_resolved,
            &self.dead_lettered,
            &self.sessions_completed,
            &self.sessions_failed,
            &self.bytes_transferred,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.durations.lock().clear();
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(100)
    }
}
