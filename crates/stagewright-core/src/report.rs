//! Versioned mission and failure reports.
//!
//! A report is generated exactly once when a run terminates and written
//! through [`write_report`], the only encoder. `reports/<run_id>.json` is
//! write-once; `report.json` is replaced with the latest report for pollers.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::recovery::RecoveryDecision;
use crate::state::BuildState;

pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// Lines of stage output embedded in a failure report.
pub const LOG_TAIL_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Aborted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Failed => "failed",
            RunOutcome::Aborted => "aborted",
        }
    }
}

/// Final state of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResolution {
    Completed,
    Recovered,
    Skipped,
    Failed,
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage_id: String,
    pub weight: u8,
    pub resolution: StageResolution,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Snapshot produced on unrecoverable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub stage_id: String,
    pub error_code: ErrorCode,
    pub message: String,
    /// Command line (or engine context) that triggered the failure.
    pub command: String,
    pub build_state: BuildState,
    pub completed_count: usize,
    pub failed_count: usize,
    pub log_path: Option<PathBuf>,
    pub log_tail: Vec<String>,
}

/// Immutable summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionReport {
    pub schema_version: String,
    pub run_id: Uuid,
    pub profile: String,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub progress_percent: u8,
    pub counts: StageCounts,
    pub stages: Vec<StageTiming>,
    pub recovery: Vec<RecoveryDecision>,
    pub failure: Option<FailureReport>,
}

/// Inputs gathered by the engine when a run ends.
#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub run_id: Uuid,
    pub profile: &'a str,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: &'a BuildState,
    pub stages: Vec<StageTiming>,
    pub recovery: Vec<RecoveryDecision>,
}

/// Build the summary for a finished run.
pub fn generate_report(ctx: ReportContext<'_>) -> MissionReport {
    let counts = StageCounts {
        total: ctx.stages.len(),
        completed: ctx
            .stages
            .iter()
            .filter(|s| matches!(s.resolution, StageResolution::Completed | StageResolution::Recovered))
            .count(),
        skipped: ctx
            .stages
            .iter()
            .filter(|s| s.resolution == StageResolution::Skipped)
            .count(),
        failed: ctx
            .stages
            .iter()
            .filter(|s| s.resolution == StageResolution::Failed)
            .count(),
    };
    let duration_ms = (ctx.finished_at - ctx.started_at)
        .to_std()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    MissionReport {
        schema_version: REPORT_SCHEMA_VERSION.to_string(),
        run_id: ctx.run_id,
        profile: ctx.profile.to_string(),
        outcome: ctx.outcome,
        started_at: ctx.started_at,
        finished_at: ctx.finished_at,
        duration_ms,
        progress_percent: ctx.state.progress_percent,
        counts,
        stages: ctx.stages,
        recovery: ctx.recovery,
        failure: None,
    }
}

/// What went wrong, for [`generate_failure_report`].
#[derive(Debug, Clone)]
pub struct FailureDetails<'a> {
    pub stage_id: &'a str,
    pub error_code: ErrorCode,
    pub message: String,
    pub command: String,
    pub log_path: Option<&'a Path>,
}

/// Build the summary plus the triggering error and a bounded log tail.
pub fn generate_failure_report(ctx: ReportContext<'_>, failure: FailureDetails<'_>) -> MissionReport {
    let state = ctx.state.clone();
    let mut report = generate_report(ctx);
    let log_tail = failure
        .log_path
        .map(|path| read_tail(path, LOG_TAIL_LINES))
        .unwrap_or_default();
    report.failure = Some(FailureReport {
        stage_id: failure.stage_id.to_string(),
        error_code: failure.error_code,
        message: failure.message,
        command: failure.command,
        completed_count: state.completed_count(),
        failed_count: state.failed_count(),
        build_state: state,
        log_path: failure.log_path.map(Path::to_path_buf),
        log_tail,
    });
    report
}

/// Persist `report` under `reports_dir`.
///
/// `<run_id>.json` must not already exist; `report.json` next to the
/// reports directory is atomically replaced. Returns the archived path.
pub fn write_report(reports_dir: &Path, latest: &Path, report: &MissionReport) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)?;
    let content = serde_json::to_string_pretty(report)?;

    let archived = reports_dir.join(format!("{}.json", report.run_id));
    let mut tmp = NamedTempFile::new_in(reports_dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(&archived).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            OrchestratorError::Validation(format!("report {} already written", archived.display()))
        } else {
            OrchestratorError::Io(e.error)
        }
    })?;

    write_atomic(latest, content.as_bytes())?;
    Ok(archived)
}

/// Read the latest report written by any run, if present and parseable.
pub fn read_latest_report(latest: &Path) -> Option<MissionReport> {
    let raw = fs::read_to_string(latest).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Replace `path` with `bytes` via a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| OrchestratorError::Io(e.error))?;
    Ok(())
}

/// Last `limit` lines of a log file. Missing or unreadable files yield nothing.
pub fn read_tail(path: &Path, limit: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let mut tail = VecDeque::with_capacity(limit);
    for line in BufReader::new(file).split(b'\n').map_while(|l| l.ok()) {
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(String::from_utf8_lossy(&line).into_owned());
    }
    tail.into()
}

/// Render a short human summary of a report.
pub fn render_summary(report: &MissionReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "run {} ({}) {} at {}% in {}ms\n",
        report.run_id,
        report.profile,
        report.outcome.as_str(),
        report.progress_percent,
        report.duration_ms
    ));
    out.push_str(&format!(
        "stages: {} total, {} completed, {} skipped, {} failed\n",
        report.counts.total, report.counts.completed, report.counts.skipped, report.counts.failed
    ));
    if let Some(failure) = &report.failure {
        out.push_str(&format!(
            "failed stage: {} [{}] {}\n",
            failure.stage_id, failure.error_code, failure.message
        ));
        if let Some(log) = &failure.log_path {
            out.push_str(&format!("log: {}\n", log.display()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(state: &BuildState) -> ReportContext<'_> {
        let started_at = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ReportContext {
            run_id: Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap(),
            profile: "standard",
            outcome: RunOutcome::Failed,
            started_at,
            finished_at: started_at + chrono::Duration::seconds(90),
            state,
            stages: vec![
                StageTiming {
                    stage_id: "a".into(),
                    weight: 10,
                    resolution: StageResolution::Completed,
                    attempts: 1,
                    duration_ms: 5,
                },
                StageTiming {
                    stage_id: "b".into(),
                    weight: 20,
                    resolution: StageResolution::Failed,
                    attempts: 2,
                    duration_ms: 7,
                },
                StageTiming {
                    stage_id: "c".into(),
                    weight: 30,
                    resolution: StageResolution::NotRun,
                    attempts: 0,
                    duration_ms: 0,
                },
            ],
            recovery: vec![],
        }
    }

    #[test]
    fn failure_report_schema_has_expected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("b.log");
        fs::write(&log, "line1\nline2\n").unwrap();

        let mut state = BuildState::default();
        state.mark_completed("a", 10);
        state.mark_failed("b");
        let report = generate_failure_report(
            context(&state),
            FailureDetails {
                stage_id: "b",
                error_code: ErrorCode::RecoveryExhausted,
                message: "exit 1".into(),
                command: "/bin/false /root".into(),
                log_path: Some(&log),
            },
        );

        let raw = serde_json::to_value(&report).unwrap();
        assert_eq!(raw["schema_version"], json!(REPORT_SCHEMA_VERSION));
        assert_eq!(raw["outcome"], json!("failed"));
        assert_eq!(raw["duration_ms"], json!(90_000));
        assert_eq!(raw["counts"]["completed"], json!(1));
        assert_eq!(raw["counts"]["failed"], json!(1));
        assert_eq!(raw["failure"]["stage_id"], json!("b"));
        assert_eq!(raw["failure"]["error_code"], json!("recovery_exhausted"));
        assert_eq!(raw["failure"]["completed_count"], json!(1));
        assert_eq!(raw["failure"]["failed_count"], json!(1));
        assert_eq!(raw["failure"]["log_tail"], json!(["line1", "line2"]));
    }

    #[test]
    fn archived_report_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports");
        let latest = dir.path().join("report.json");
        let state = BuildState::default();
        let report = generate_report(context(&state));

        let archived = write_report(&reports, &latest, &report).unwrap();
        assert!(archived.exists());
        assert_eq!(read_latest_report(&latest).unwrap(), report);
        assert!(write_report(&reports, &latest, &report).is_err());
    }

    #[test]
    fn tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("x.log");
        let body: String = (0..100).map(|i| format!("line {i}\n")).collect();
        fs::write(&log, body).unwrap();

        let tail = read_tail(&log, 3);
        assert_eq!(tail, vec!["line 97", "line 98", "line 99"]);
        assert!(read_tail(&dir.path().join("missing"), 3).is_empty());
    }

    #[test]
    fn summary_names_failed_stage() {
        let mut state = BuildState::default();
        state.mark_failed("b");
        let report = generate_failure_report(
            context(&state),
            FailureDetails {
                stage_id: "b",
                error_code: ErrorCode::StageTimeout,
                message: "timed out".into(),
                command: "b.sh".into(),
                log_path: None,
            },
        );
        let text = render_summary(&report);
        assert!(text.contains("failed stage: b [stage_timeout]"));
    }
}
