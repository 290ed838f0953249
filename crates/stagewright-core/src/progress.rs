//! Monotonic progress tracking and the on-disk progress marker.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::report::write_atomic;

/// Tracks `progress_percent` for one run.
///
/// The value is the weight of the highest stage that reached a completed or
/// skipped state; it never decreases. Every observed value is kept so callers
/// can audit monotonicity after the run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    marker: Option<PathBuf>,
    current: u8,
    history: Vec<u8>,
}

impl ProgressTracker {
    /// Tracker that mirrors each change into `marker` (plain text percentage).
    pub fn with_marker(marker: impl Into<PathBuf>, initial: u8) -> Self {
        Self {
            marker: Some(marker.into()),
            current: initial,
            history: vec![initial],
        }
    }

    /// Tracker without a marker file.
    pub fn in_memory(initial: u8) -> Self {
        Self {
            marker: None,
            current: initial,
            history: vec![initial],
        }
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn history(&self) -> &[u8] {
        &self.history
    }

    /// Record that a stage of `weight` finished. Lower weights leave the value unchanged.
    pub fn advance(&mut self, weight: u8) -> Result<u8> {
        let next = self.current.max(weight);
        self.history.push(next);
        if next != self.current {
            self.current = next;
            self.persist()?;
        }
        Ok(self.current)
    }

    /// Write the current value to the marker file, if any.
    pub fn persist(&self) -> Result<()> {
        if let Some(marker) = &self.marker {
            write_atomic(marker, format!("{}\n", self.current).as_bytes())?;
            debug!(progress = self.current, marker = %marker.display(), "Progress marker updated");
        }
        Ok(())
    }
}

/// Read a progress marker written by [`ProgressTracker`].
pub fn read_progress(marker: &Path) -> Option<u8> {
    fs::read_to_string(marker).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_monotonic() {
        let mut tracker = ProgressTracker::in_memory(0);
        tracker.advance(10).unwrap();
        tracker.advance(30).unwrap();
        tracker.advance(20).unwrap();
        assert_eq!(tracker.current(), 30);
        assert_eq!(tracker.history(), &[0, 10, 30, 30]);
        assert!(tracker.history().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_marker_file_tracks_current_value() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("state/progress");
        let mut tracker = ProgressTracker::with_marker(&marker, 0);
        tracker.persist().unwrap();
        assert_eq!(read_progress(&marker), Some(0));

        tracker.advance(45).unwrap();
        assert_eq!(read_progress(&marker), Some(45));
        assert_eq!(fs::read_to_string(&marker).unwrap(), "45\n");
    }

    #[test]
    fn test_missing_marker_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_progress(&dir.path().join("progress")), None);
    }
}
