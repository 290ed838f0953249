//! Read-only status inspection and the `clean` operation.

use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::lock::{LockInfo, LockManager, BUILD_ROOT_LOCK};
use crate::progress::read_progress;
use crate::registry::StageRegistry;
use crate::report::{read_latest_report, RunOutcome};
use crate::state::{BuildPhase, BuildState, BuildStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Stale,
    Failed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLine {
    pub stage_id: String,
    pub weight: u8,
    pub status: StageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestRun {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub finished_at: chrono::DateTime<Utc>,
    pub failed_stage: Option<String>,
}

/// Snapshot printed by the `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub profile: String,
    pub phase: BuildPhase,
    pub status: BuildStatus,
    pub progress_percent: u8,
    /// Value of the on-disk progress marker, which may lag behind replay.
    pub progress_marker: Option<u8>,
    pub stages: Vec<StageLine>,
    pub corrupted_records: usize,
    pub lock_holder: Option<LockInfo>,
    pub latest_run: Option<LatestRun>,
}

/// Replay the checkpoint log for `profile` without taking any lock.
pub fn inspect(config: &EngineConfig, registry: &StageRegistry, profile: &str) -> Result<StatusView> {
    let layout = &config.layout;
    let store = CheckpointStore::open(&layout.checkpoint_log)?;
    let log = store.load()?;
    let registry = registry.for_profile(profile);
    let state = BuildState::replay(&log, &registry, Utc::now(), config.staleness_window());

    let stages: Vec<StageLine> = registry
        .ordered_stages()
        .map(|stage| StageLine {
            stage_id: stage.id.clone(),
            weight: stage.weight,
            status: if state.completed.contains(&stage.id) {
                StageStatus::Completed
            } else if state.failed.contains(&stage.id) {
                StageStatus::Failed
            } else if state.stale.contains(&stage.id) {
                StageStatus::Stale
            } else {
                StageStatus::Pending
            },
        })
        .collect();

    let phase = stages_phase(&stages);
    let lock_holder = read_lock_holder(&layout.locks_dir);
    let latest_run = read_latest_report(&layout.latest_report).map(|report| LatestRun {
        run_id: report.run_id.to_string(),
        outcome: report.outcome,
        finished_at: report.finished_at,
        failed_stage: report.failure.map(|f| f.stage_id),
    });

    Ok(StatusView {
        profile: profile.to_string(),
        phase,
        status: state.status,
        progress_percent: state.progress_percent,
        progress_marker: read_progress(&layout.progress_marker),
        stages,
        corrupted_records: log.corrupted.len(),
        lock_holder,
        latest_run,
    })
}

// The next stage that still has to run, if any.
fn stages_phase(stages: &[StageLine]) -> BuildPhase {
    stages
        .iter()
        .find(|s| s.status != StageStatus::Completed)
        .map(|s| BuildPhase::Stage(s.stage_id.clone()))
        .unwrap_or(BuildPhase::Finished)
}

fn read_lock_holder(locks_dir: &Path) -> Option<LockInfo> {
    let raw = fs::read_to_string(locks_dir.join(format!("{BUILD_ROOT_LOCK}.lock"))).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Render a status view for humans.
pub fn render_status(view: &StatusView) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "profile: {}\nstatus: {:?}\nnext: {}\nprogress: {}%\n",
        view.profile, view.status, view.phase, view.progress_percent
    ));
    for line in &view.stages {
        out.push_str(&format!("  [{:>3}] {:<24} {:?}\n", line.weight, line.stage_id, line.status));
    }
    if view.corrupted_records > 0 {
        out.push_str(&format!("corrupted checkpoint records: {}\n", view.corrupted_records));
    }
    match &view.lock_holder {
        Some(holder) => out.push_str(&format!(
            "lock: held by {} (pid {}) since {}\n",
            holder.owner_id, holder.pid, holder.acquired_at
        )),
        None => out.push_str("lock: free\n"),
    }
    if let Some(run) = &view.latest_run {
        out.push_str(&format!("last run: {} {}", run.run_id, run.outcome.as_str()));
        if let Some(stage) = &run.failed_stage {
            out.push_str(&format!(" at {stage}"));
        }
        out.push('\n');
    }
    out
}

/// What `clean` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanSummary {
    pub checkpoints_cleared: bool,
    pub logs_removed: usize,
    pub reports_removed: usize,
}

/// Clear the checkpoint log, progress marker and stage logs under the
/// build-root lock. With `all`, also remove reports.
pub async fn clean(config: &EngineConfig, owner_id: &str, all: bool) -> Result<CleanSummary> {
    let layout = &config.layout;
    let locks = LockManager::new(&layout.locks_dir, owner_id)?.with_staleness(config.lock_staleness);
    let lock = locks.acquire(BUILD_ROOT_LOCK, config.lock_wait).await?;

    let store = CheckpointStore::open(&layout.checkpoint_log)?;
    store.clear()?;
    remove_if_present(&layout.progress_marker)?;
    let mut summary = CleanSummary {
        checkpoints_cleared: true,
        logs_removed: clear_dir(&layout.logs_dir)?,
        reports_removed: 0,
    };
    if all {
        summary.reports_removed = clear_dir(&layout.reports_dir)?;
        remove_if_present(&layout.latest_report)?;
    }
    lock.release();

    info!(
        logs = summary.logs_removed,
        reports = summary.reports_removed,
        "Cleaned build bookkeeping"
    );
    Ok(summary)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn clear_dir(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        } else {
            warn!(path = %path.display(), "Leaving non-file entry in place");
        }
    }
    Ok(removed)
}
