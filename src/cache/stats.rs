//! Sweep Statistics Module
//!
//! Tracks what the expiration sweep did over the lifetime of a cache.

use serde::Serialize;

// == Sweep Stats ==
/// Counters maintained by the expiration sweep.
///
/// Stored inside the entry list, so they are guarded by the same lock as the
/// entries they describe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Number of completed sweep passes
    pub passes: u64,
    /// Number of due entries rescheduled by a pass
    pub processed: u64,
    /// Number of due entries that were still referenced and kept
    pub deferred: u64,
    /// Number of idle entries handed over for teardown
    pub reclaimed: u64,
}

impl SweepStats {
    // == Constructor ==
    /// Creates a new SweepStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Reclaim Rate ==
    /// Share of processed entries that were reclaimed.
    ///
    /// Returns 0.0 if no entry has been processed yet.
    pub fn reclaim_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.reclaimed as f64 / self.processed as f64
        }
    }

    // == Record Pass ==
    /// Folds the outcome of one pass into the counters.
    pub fn record_pass(&mut self, processed: usize, deferred: usize, reclaimed: usize) {
        self.passes += 1;
        self.processed += processed as u64;
        self.deferred += deferred as u64;
        self.reclaimed += reclaimed as u64;
    }
}
