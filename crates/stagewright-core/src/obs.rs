//! Structured lifecycle events for pipeline runs.
//!
//! - `run_span` tags everything logged during a run with its id and profile
//! - `emit_*` functions for run, stage, checkpoint, lock and recovery events
//!
//! Events are logged at `info!` unless noted; filter with `RUST_LOG`.

use tracing::{info, warn};

use crate::checkpoint::CheckpointStatus;
use crate::recovery::RecoveryDecision;

/// Span for one run. Attach with `Instrument::instrument` so it follows the
/// run future across await points.
pub fn run_span(run_id: &str, profile: &str) -> tracing::Span {
    tracing::info_span!("stagewright.run", run_id = %run_id, profile = %profile)
}

pub fn emit_run_started(run_id: &str, profile: &str, stages: usize, resumed_progress: u8) {
    info!(
        event = "run.started",
        run_id = %run_id,
        profile = %profile,
        stages = stages,
        progress = resumed_progress,
    );
}

pub fn emit_run_finished(run_id: &str, outcome: &str, duration_ms: u64, progress: u8) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        outcome = %outcome,
        duration_ms = duration_ms,
        progress = progress,
    );
}

pub fn emit_stage_started(stage_id: &str, weight: u8, attempt: u32) {
    info!(event = "stage.started", stage = %stage_id, weight = weight, attempt = attempt);
}

pub fn emit_stage_finished(stage_id: &str, attempt: u32, passed: bool, duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage_id,
        attempt = attempt,
        passed = passed,
        duration_ms = duration_ms,
    );
}

pub fn emit_stage_skipped(stage_id: &str, weight: u8) {
    info!(event = "stage.skipped", stage = %stage_id, weight = weight, "Completed checkpoint found; skipping");
}

pub fn emit_checkpoint_appended(stage_id: &str, status: CheckpointStatus) {
    tracing::debug!(event = "checkpoint.appended", stage = %stage_id, status = status.as_str());
}

/// Warning level: a presumed-dead owner's lock was removed.
pub fn emit_lock_broken(resource: &str, previous_owner: &str) {
    warn!(event = "lock.broken", resource = %resource, previous_owner = %previous_owner);
}

pub fn emit_recovery_decided(decision: &RecoveryDecision) {
    info!(
        event = "recovery.decided",
        stage = %decision.stage_id,
        attempt = decision.attempt,
        error_code = %decision.error_code,
        strategy = %decision.strategy,
        outcome = ?decision.outcome,
        rationale = %decision.rationale,
    );
}
