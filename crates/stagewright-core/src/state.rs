//! In-memory build state, rebuilt from the checkpoint log at startup.
//!
//! The engine is the only writer. Nothing here is trusted unless it can be
//! recomputed from durable records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checkpoint::{authoritative_completions, validate_checkpoint, CheckpointStatus, CheckpointValidity, LoadedLog};
use crate::registry::StageRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Initializing,
    Active,
    Completed,
    Failed,
}

/// Where the engine currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "stage")]
pub enum BuildPhase {
    Idle,
    Stage(String),
    Finished,
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildPhase::Idle => f.write_str("idle"),
            BuildPhase::Stage(id) => f.write_str(id),
            BuildPhase::Finished => f.write_str("finished"),
        }
    }
}

/// Projection of the checkpoint log plus the current run's transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub phase: BuildPhase,
    pub progress_percent: u8,
    pub status: BuildStatus,
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    /// Completion records rejected as older than the staleness window.
    pub stale: BTreeSet<String>,
    /// Failed attempts per stage in the current run.
    pub attempts: BTreeMap<String, u32>,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            phase: BuildPhase::Idle,
            progress_percent: 0,
            status: BuildStatus::Initializing,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            stale: BTreeSet::new(),
            attempts: BTreeMap::new(),
        }
    }
}

impl BuildState {
    /// Rebuild state for `registry` from previously loaded checkpoint records.
    ///
    /// Stale completions are treated as absent; corrupted lines were already
    /// dropped by the loader. Records for stages outside the registry are ignored.
    pub fn replay(
        log: &LoadedLog,
        registry: &StageRegistry,
        now: DateTime<Utc>,
        staleness: ChronoDuration,
    ) -> Self {
        let mut state = BuildState::default();
        let completions = authoritative_completions(&log.records);

        let mut latest: BTreeMap<&str, CheckpointStatus> = BTreeMap::new();
        for record in &log.records {
            latest.insert(record.stage_id.as_str(), record.status);
        }

        for stage in registry.ordered_stages() {
            if let Some(record) = completions.get(stage.id.as_str()) {
                match validate_checkpoint(record, now, staleness) {
                    CheckpointValidity::Valid => {
                        state.completed.insert(stage.id.clone());
                        state.progress_percent = state.progress_percent.max(stage.weight);
                        continue;
                    }
                    CheckpointValidity::Stale { age } => {
                        warn!(
                            stage = %stage.id,
                            age_hours = age.num_hours(),
                            "Ignoring stale completion checkpoint; stage will re-run"
                        );
                        state.stale.insert(stage.id.clone());
                    }
                    CheckpointValidity::Corrupted(reason) => {
                        warn!(stage = %stage.id, reason = %reason, "Ignoring invalid completion checkpoint");
                    }
                }
            }
            if latest.get(stage.id.as_str()) == Some(&CheckpointStatus::Failed) {
                state.failed.insert(stage.id.clone());
            }
        }

        state.status = if !registry.is_empty() && state.completed.len() == registry.len() {
            BuildStatus::Completed
        } else if !state.failed.is_empty() {
            BuildStatus::Failed
        } else if !state.completed.is_empty() {
            BuildStatus::Active
        } else {
            BuildStatus::Initializing
        };

        debug!(
            completed = state.completed.len(),
            failed = state.failed.len(),
            stale = state.stale.len(),
            progress = state.progress_percent,
            "Replayed checkpoint log"
        );
        state
    }

    pub fn is_completed(&self, stage_id: &str) -> bool {
        self.completed.contains(stage_id)
    }

    pub fn mark_started(&mut self, stage_id: &str) {
        self.phase = BuildPhase::Stage(stage_id.to_string());
        self.status = BuildStatus::Active;
    }

    pub fn mark_completed(&mut self, stage_id: &str, weight: u8) {
        self.failed.remove(stage_id);
        self.completed.insert(stage_id.to_string());
        self.progress_percent = self.progress_percent.max(weight);
    }

    /// Record a stage that already had a standing completion checkpoint.
    pub fn mark_skipped(&mut self, stage_id: &str, weight: u8) {
        self.skipped.insert(stage_id.to_string());
        self.completed.insert(stage_id.to_string());
        self.progress_percent = self.progress_percent.max(weight);
    }

    /// Record a failed attempt; returns the failure count for this run.
    pub fn mark_failed(&mut self, stage_id: &str) -> u32 {
        self.failed.insert(stage_id.to_string());
        let count = self.attempts.entry(stage_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn failures_for(&self, stage_id: &str) -> u32 {
        self.attempts.get(stage_id).copied().unwrap_or(0)
    }

    pub fn finish(&mut self, status: BuildStatus) {
        self.phase = BuildPhase::Finished;
        self.status = status;
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Stages that failed during this run and have not since completed.
    /// Failures replayed from earlier runs are not counted.
    pub fn failed_count(&self) -> usize {
        self.failed
            .iter()
            .filter(|id| self.attempts.contains_key(id.as_str()))
            .count()
    }
}
