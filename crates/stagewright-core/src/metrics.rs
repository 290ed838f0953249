//! Per-run atomic counters.
//!
//! Counters are bumped silently at the call site; [`Metrics::flush`] emits
//! them as a single `info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lightweight counters shared by the engine and its parallel group members.
#[derive(Debug, Default)]
pub struct Metrics {
    stages_invoked: AtomicU64,
    stages_skipped: AtomicU64,
    retries: AtomicU64,
    locks_broken: AtomicU64,
    corrupted_records: AtomicU64,
}

/// Plain copy of the counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub stages_invoked: u64,
    pub stages_skipped: u64,
    pub retries: u64,
    pub locks_broken: u64,
    pub corrupted_records: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            stages_invoked: AtomicU64::new(0),
            stages_skipped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            locks_broken: AtomicU64::new(0),
            corrupted_records: AtomicU64::new(0),
        }
    }

    pub fn inc_stages_invoked(&self) {
        self.stages_invoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stages_skipped(&self) {
        self.stages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_locks_broken(&self) {
        self.locks_broken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_corrupted_records(&self, n: u64) {
        self.corrupted_records.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stages_invoked: self.stages_invoked.load(Ordering::Relaxed),
            stages_skipped: self.stages_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            locks_broken: self.locks_broken.load(Ordering::Relaxed),
            corrupted_records: self.corrupted_records.load(Ordering::Relaxed),
        }
    }

    /// Emit all counters as one `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            stages_invoked = s.stages_invoked,
            stages_skipped = s.stages_skipped,
            retries = s.retries,
            locks_broken = s.locks_broken,
            corrupted_records = s.corrupted_records,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_stages_invoked();
        m.inc_stages_invoked();
        m.inc_stages_skipped();
        m.inc_retries();
        m.add_corrupted_records(3);

        let s = m.snapshot();
        assert_eq!(s.stages_invoked, 2);
        assert_eq!(s.stages_skipped, 1);
        assert_eq!(s.retries, 1);
        assert_eq!(s.locks_broken, 0);
        assert_eq!(s.corrupted_records, 3);
        m.flush();
    }
}
