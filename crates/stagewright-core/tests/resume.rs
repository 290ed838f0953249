//! Resume semantics: checkpoints decide which stages run again.

mod common;

use std::fs::OpenOptions;
use std::io::Write;

use chrono::Utc;
use common::{assert_monotonic, engine, registry, Workspace};
use stagewright_core::{
    Checkpoint, CheckpointPayload, CheckpointStatus, CheckpointStore, ErrorCode, RecoveryPolicy,
    RecoveryStrategy, RetrySchedule, RunOutcome, StageResolution,
};
use tokio::sync::watch;
use uuid::Uuid;

fn no_retry() -> RecoveryPolicy {
    RecoveryPolicy::new(RecoveryStrategy::NoRetry)
}

/// Test: a completed run followed by a second run invokes nothing
#[tokio::test]
async fn test_idempotent_resume() {
    let ws = Workspace::new();
    let stages = || {
        registry(vec![
            ws.stage("fetch", 10, "exit 0"),
            ws.stage("compile", 50, "exit 0"),
            ws.stage("package", 100, "exit 0"),
        ])
    };
    let (_tx, rx) = watch::channel(false);

    let mut first = engine(ws.config(), stages(), no_retry());
    let summary = first.run("standard", rx.clone()).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.metrics.stages_invoked, 3);
    assert_monotonic(&summary.progress_history);
    assert_eq!(summary.report.progress_percent, 100);

    let mut second = engine(ws.config(), stages(), no_retry());
    let summary = second.run("standard", rx).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.metrics.stages_invoked, 0);
    assert_eq!(summary.metrics.stages_skipped, 3);
    assert!(summary
        .report
        .stages
        .iter()
        .all(|s| s.resolution == StageResolution::Skipped));
    for id in ["fetch", "compile", "package"] {
        assert_eq!(ws.invocations(id), 1, "{id} ran again");
    }
}

/// Test: --fresh semantics run everything again without deleting checkpoints
#[tokio::test]
async fn test_resume_disabled_reruns_everything() {
    let ws = Workspace::new();
    let stages = || registry(vec![ws.stage("a", 10, "exit 0"), ws.stage("b", 20, "exit 0")]);
    let (_tx, rx) = watch::channel(false);

    engine(ws.config(), stages(), no_retry())
        .run("standard", rx.clone())
        .await
        .unwrap();

    let mut config = ws.config();
    config.resume = false;
    let summary = engine(config, stages(), no_retry())
        .run("standard", rx)
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(ws.invocations("a"), 2);
    assert_eq!(ws.invocations("b"), 2);

    let store = CheckpointStore::open(&ws.config().layout.checkpoint_log).unwrap();
    let completions = store
        .load()
        .unwrap()
        .records
        .iter()
        .filter(|r| r.status == CheckpointStatus::Completed)
        .count();
    assert_eq!(completions, 4);
}

/// Test: a completion older than the staleness window is ignored
#[tokio::test]
async fn test_stale_checkpoint_forces_rerun() {
    let ws = Workspace::new();
    let config = ws.config();
    config.layout.ensure().unwrap();
    let store = CheckpointStore::open(&config.layout.checkpoint_log).unwrap();
    store
        .append(&Checkpoint::at(
            "a",
            Utc::now() - chrono::Duration::hours(25),
            CheckpointStatus::Completed,
            CheckpointPayload::new(Uuid::new_v4(), 1),
        ))
        .unwrap();
    store
        .append(&Checkpoint::at(
            "b",
            Utc::now() - chrono::Duration::hours(1),
            CheckpointStatus::Completed,
            CheckpointPayload::new(Uuid::new_v4(), 1),
        ))
        .unwrap();

    let reg = registry(vec![ws.stage("a", 10, "exit 0"), ws.stage("b", 20, "exit 0")]);
    let (_tx, rx) = watch::channel(false);
    let summary = engine(config, reg, no_retry()).run("standard", rx).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(ws.invocations("a"), 1, "stale completion must not be trusted");
    assert_eq!(ws.invocations("b"), 0, "fresh completion must be honored");
}

/// Test: one malformed record does not hide the valid ones around it
#[tokio::test]
async fn test_corrupted_record_is_discarded() {
    let ws = Workspace::new();
    let config = ws.config();
    config.layout.ensure().unwrap();
    let store = CheckpointStore::open(&config.layout.checkpoint_log).unwrap();
    store
        .append(&Checkpoint::new(
            "a",
            CheckpointStatus::Completed,
            CheckpointPayload::new(Uuid::new_v4(), 1),
        ))
        .unwrap();
    // Torn write: no trailing newline.
    let mut log = OpenOptions::new()
        .append(true)
        .open(&config.layout.checkpoint_log)
        .unwrap();
    log.write_all(b"1700000000:b:compl").unwrap();
    drop(log);
    store
        .append(&Checkpoint::new(
            "b",
            CheckpointStatus::Completed,
            CheckpointPayload::new(Uuid::new_v4(), 1),
        ))
        .unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.records.len(), 2);
    assert_eq!(loaded.corrupted.len(), 1);

    let reg = registry(vec![
        ws.stage("a", 10, "exit 0"),
        ws.stage("b", 20, "exit 0"),
        ws.stage("c", 30, "exit 0"),
    ]);
    let (_tx, rx) = watch::channel(false);
    let summary = engine(config, reg, no_retry()).run("standard", rx).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.metrics.corrupted_records, 1);
    assert_eq!(ws.invocations("a"), 0);
    assert_eq!(ws.invocations("b"), 0);
    assert_eq!(ws.invocations("c"), 1);
}

/// Test: an exhausted stage halts the run, and the next run resumes after
/// the last good checkpoint
#[tokio::test]
async fn test_failure_containment_then_resume() {
    let ws = Workspace::new();
    let stages = || {
        registry(vec![
            ws.stage("a", 10, "exit 0"),
            ws.stage("b", 20, "echo 'linker error' >&2\nexit 1"),
            ws.stage("c", 30, "exit 0"),
        ])
    };
    let policy = || {
        RecoveryPolicy::default().with_strategy(
            "b",
            RecoveryStrategy::Retry {
                schedule: RetrySchedule::new(1, 10, 10),
            },
        )
    };
    let (_tx, rx) = watch::channel(false);

    let mut first = engine(ws.config(), stages(), policy());
    let summary = first.run("standard", rx.clone()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(ws.invocations("a"), 1);
    assert_eq!(ws.invocations("b"), 2);
    assert_eq!(ws.invocations("c"), 0);
    assert_monotonic(&summary.progress_history);

    let failure = summary.report.failure.as_ref().unwrap();
    assert_eq!(failure.stage_id, "b");
    assert_eq!(failure.error_code, ErrorCode::StageExecution);
    assert!(failure.log_tail.iter().any(|l| l.contains("linker error")));
    assert!(summary.report_path.exists());
    let latest = stagewright_core::read_latest_report(&ws.config().layout.latest_report).unwrap();
    assert_eq!(latest.run_id, summary.run_id);

    let store = CheckpointStore::open(&ws.config().layout.checkpoint_log).unwrap();
    assert!(store
        .latest_completed("a", Utc::now(), chrono::Duration::hours(24))
        .unwrap()
        .is_some());

    ws.rewrite("b", "exit 0");
    let mut second = engine(ws.config(), stages(), policy());
    let summary = second.run("standard", rx).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(ws.invocations("a"), 1);
    assert_eq!(ws.invocations("b"), 3);
    assert_eq!(ws.invocations("c"), 1);
    assert_monotonic(&summary.progress_history);
    assert_eq!(summary.progress_history.first(), Some(&10));
}

/// Test: a failure report counts only failures from the run it describes
#[tokio::test]
async fn test_failure_report_counts_current_run_only() {
    let ws = Workspace::new();
    let config = ws.config();
    config.layout.ensure().unwrap();
    let store = CheckpointStore::open(&config.layout.checkpoint_log).unwrap();
    store
        .append(&Checkpoint::new(
            "c",
            CheckpointStatus::Failed,
            CheckpointPayload::new(Uuid::new_v4(), 1),
        ))
        .unwrap();

    let reg = registry(vec![
        ws.stage("a", 10, "exit 0"),
        ws.stage("b", 20, "exit 4"),
        ws.stage("c", 30, "exit 0"),
    ]);
    let (_tx, rx) = watch::channel(false);
    let summary = engine(config, reg, no_retry()).run("standard", rx).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(ws.invocations("c"), 0);
    let failure = summary.report.failure.as_ref().unwrap();
    assert_eq!(failure.stage_id, "b");
    assert_eq!(failure.completed_count, 1);
    assert_eq!(failure.failed_count, 1);
}

/// Test: stages outside the selected profile are neither run nor required
#[tokio::test]
async fn test_profile_filters_stages() {
    let ws = Workspace::new();
    let reg = registry(vec![
        ws.stage("base", 10, "exit 0"),
        ws.stage("harden", 20, "exit 0")
            .for_profiles(vec!["security".to_string()]),
        ws.stage("finish", 30, "test \"$STAGEWRIGHT_PROFILE\" = minimal"),
    ]);
    let (_tx, rx) = watch::channel(false);

    let summary = engine(ws.config(), reg, no_retry())
        .run("minimal", rx)
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(ws.invocations("harden"), 0);
    assert_eq!(ws.invocations("finish"), 1);
    assert_eq!(summary.report.stages.len(), 2);
}
