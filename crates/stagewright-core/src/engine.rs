//! Execution engine.
//!
//! `INIT -> VALIDATING -> RUNNING -> {COMPLETED, FAILED, ABORTED}`.
//!
//! Validation is fail-fast and has no side effects on the checkpoint log. The
//! run loop walks the registry in weight order one execution unit at a time:
//! completed stages are skipped, every attempt runs under the build-root lock
//! between a `started` and a terminal checkpoint, and failures go to the
//! recovery policy. An exhausted stage halts the run; later stages never start.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointPayload, CheckpointStatus, CheckpointStore};
use crate::config::{EngineConfig, Pipeline};
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::lock::{LockGuard, LockManager, BUILD_ROOT_LOCK};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::obs;
use crate::progress::ProgressTracker;
use crate::recovery::{FailureContext, RecoveryDecision, RecoveryOutcome, RecoveryPolicy};
use crate::registry::{ExecutionUnit, Stage, StageRegistry};
use crate::report::{
    generate_failure_report, generate_report, write_report, FailureDetails, MissionReport,
    ReportContext, RunOutcome, StageResolution, StageTiming,
};
use crate::runner::{Invocation, StageRunner};
use crate::state::{BuildState, BuildStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Init,
    Validating,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub report: MissionReport,
    pub report_path: PathBuf,
    /// Every `progress_percent` value observed, in order.
    pub progress_history: Vec<u8>,
    pub metrics: MetricsSnapshot,
    pub state: BuildState,
}

impl RunSummary {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Completed => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Aborted => 130,
        }
    }
}

/// Why a stage stopped without completing.
#[derive(Debug, Clone)]
struct StageFailure {
    stage_id: String,
    error_code: ErrorCode,
    message: String,
    command: String,
    log_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
enum StageOutcome {
    Completed,
    Recovered,
    Skipped,
    Exhausted(StageFailure),
    Aborted(StageFailure),
}

impl StageOutcome {
    fn halts(&self) -> bool {
        matches!(self, StageOutcome::Exhausted(_) | StageOutcome::Aborted(_))
    }
}

enum Next {
    Retry,
    Stop(StageOutcome),
}

/// Mutable bookkeeping for one run, shared by parallel group members.
struct RunContext {
    run_id: Uuid,
    profile: String,
    cancel: watch::Receiver<bool>,
    state: Mutex<BuildState>,
    progress: Mutex<ProgressTracker>,
    timings: Mutex<BTreeMap<String, StageTiming>>,
    decisions: Mutex<Vec<RecoveryDecision>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunContext {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn record_attempt(&self, stage: &Stage, duration: Duration) {
        let mut timings = guard(&self.timings);
        let timing = timings.entry(stage.id.clone()).or_insert_with(|| StageTiming {
            stage_id: stage.id.clone(),
            weight: stage.weight,
            resolution: StageResolution::NotRun,
            attempts: 0,
            duration_ms: 0,
        });
        timing.attempts += 1;
        timing.duration_ms += duration.as_millis() as u64;
    }

    fn resolve(&self, stage: &Stage, resolution: StageResolution) {
        let mut timings = guard(&self.timings);
        timings
            .entry(stage.id.clone())
            .or_insert_with(|| StageTiming {
                stage_id: stage.id.clone(),
                weight: stage.weight,
                resolution,
                attempts: 0,
                duration_ms: 0,
            })
            .resolution = resolution;
    }
}

/// Resolves once `cancel` reads `true`. Never resolves if the sender is gone.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct ExecutionEngine {
    config: EngineConfig,
    registry: StageRegistry,
    recovery: RecoveryPolicy,
    runner: Arc<dyn StageRunner>,
    store: CheckpointStore,
    locks: LockManager,
    metrics: Metrics,
    state: EngineState,
}

impl ExecutionEngine {
    /// Create an engine for `config.layout.root`, which must already exist.
    pub fn new(config: EngineConfig, pipeline: Pipeline, runner: Arc<dyn StageRunner>) -> Result<Self> {
        let root = &config.layout.root;
        if !root.is_dir() {
            return Err(OrchestratorError::Validation(format!(
                "working root {} is not a directory",
                root.display()
            )));
        }
        let store = CheckpointStore::open(&config.layout.checkpoint_log)?;
        let owner_id = format!("{}-{}", std::process::id(), Uuid::new_v4().simple());
        let locks = LockManager::new(&config.layout.locks_dir, owner_id)?.with_staleness(config.lock_staleness);

        Ok(Self {
            config,
            registry: pipeline.registry,
            recovery: pipeline.recovery,
            runner,
            store,
            locks,
            metrics: Metrics::new(),
            state: EngineState::Init,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Pre-flight checks for `profile`. Runs no stage and writes nothing.
    ///
    /// On failure the engine moves to `Failed` and every problem found is
    /// listed in the returned `Validation` error.
    pub fn validate(&mut self, profile: &str) -> Result<()> {
        if !matches!(self.state, EngineState::Init | EngineState::Validating) {
            return Err(OrchestratorError::Validation(format!(
                "engine cannot validate from state {:?}",
                self.state
            )));
        }
        self.state = EngineState::Validating;

        let problems = self.preflight(profile);
        if problems.is_empty() {
            info!(profile = %profile, stages = self.registry.for_profile(profile).len(), "Pipeline validated");
            Ok(())
        } else {
            self.state = EngineState::Failed;
            for problem in &problems {
                error!(problem = %problem, "Validation failed");
            }
            Err(OrchestratorError::Validation(problems.join("; ")))
        }
    }

    fn preflight(&self, profile: &str) -> Vec<String> {
        let mut problems = Vec::new();

        if !self.config.knows_profile(profile) {
            problems.push(format!(
                "unknown profile {profile} (known: {})",
                self.config.profiles.join(", ")
            ));
        }
        let registry = self.registry.for_profile(profile);
        if registry.is_empty() {
            problems.push(format!("no stages run under profile {profile}"));
        }
        if let Err(e) = registry.execution_units() {
            problems.push(e.to_string());
        }
        for stage in registry.ordered_stages() {
            if !is_resolvable(&stage.executable) {
                problems.push(format!(
                    "stage {}: executable {} is not resolvable",
                    stage.id,
                    stage.executable.display()
                ));
            }
        }
        for dir in &self.config.required_dirs {
            let path = self.config.layout.root.join(dir);
            if !path.is_dir() {
                problems.push(format!("required directory {} is missing", path.display()));
            }
        }
        problems
    }

    /// Validate, then run every stage of `profile` to completion or halt.
    ///
    /// Stage failures never surface as `Err`; they end the run with a
    /// `Failed` or `Aborted` outcome and a written failure report. `Err` is
    /// returned for validation failures and for errors writing the report.
    pub async fn run(&mut self, profile: &str, cancel: watch::Receiver<bool>) -> Result<RunSummary> {
        self.validate(profile)?;
        let run_id = Uuid::new_v4();
        let span = obs::run_span(&run_id.to_string(), profile);
        self.run_validated(run_id, profile, cancel).instrument(span).await
    }

    async fn run_validated(
        &mut self,
        run_id: Uuid,
        profile: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        self.state = EngineState::Running;
        self.config.layout.ensure()?;
        let started_at = Utc::now();
        let registry = self.registry.for_profile(profile);

        let log = self.store.load()?;
        self.metrics.add_corrupted_records(log.corrupted.len() as u64);
        let mut state = if self.config.resume {
            BuildState::replay(&log, &registry, started_at, self.config.staleness_window())
        } else {
            info!("Resume disabled; ignoring existing checkpoints");
            BuildState::default()
        };
        state.status = BuildStatus::Active;

        let progress = ProgressTracker::with_marker(&self.config.layout.progress_marker, state.progress_percent);
        progress.persist()?;
        obs::emit_run_started(&run_id.to_string(), profile, registry.len(), state.progress_percent);

        let run = RunContext {
            run_id,
            profile: profile.to_string(),
            cancel,
            state: Mutex::new(state),
            progress: Mutex::new(progress),
            timings: Mutex::new(BTreeMap::new()),
            decisions: Mutex::new(Vec::new()),
        };

        let mut halted: Option<StageOutcome> = None;
        for unit in registry.execution_units()? {
            let first = unit.stages()[0];
            if run.is_cancelled() {
                halted = Some(StageOutcome::Aborted(StageFailure {
                    stage_id: first.id.clone(),
                    error_code: ErrorCode::Aborted,
                    message: "interrupted before stage started".to_string(),
                    command: self.invocation(&run, first, 1).command_line(),
                    log_path: None,
                }));
                break;
            }

            let outcomes = match &unit {
                ExecutionUnit::Single(stage) => self.drive_stage(&run, stage, false).await.map(|o| vec![o]),
                ExecutionUnit::Group { name, stages } => self.drive_group(&run, name, stages).await,
            };
            let outcomes = match outcomes {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    error!(stage = %first.id, error = %e, "Engine error while running stage");
                    vec![StageOutcome::Exhausted(StageFailure {
                        stage_id: first.id.clone(),
                        error_code: e.code(),
                        message: e.to_string(),
                        command: self.invocation(&run, first, 1).command_line(),
                        log_path: None,
                    })]
                }
            };

            // An abort outranks an exhausted sibling in the same group.
            if let Some(outcome) = outcomes
                .iter()
                .find(|o| matches!(o, StageOutcome::Aborted(_)))
                .or_else(|| outcomes.iter().find(|o| o.halts()))
            {
                halted = Some(outcome.clone());
                break;
            }
        }

        self.finish(run, &registry, started_at, halted)
    }

    fn finish(
        &mut self,
        run: RunContext,
        registry: &StageRegistry,
        started_at: chrono::DateTime<Utc>,
        halted: Option<StageOutcome>,
    ) -> Result<RunSummary> {
        let outcome = match &halted {
            None => RunOutcome::Completed,
            Some(StageOutcome::Aborted(_)) => RunOutcome::Aborted,
            Some(_) => RunOutcome::Failed,
        };
        self.state = match outcome {
            RunOutcome::Completed => EngineState::Completed,
            RunOutcome::Failed => EngineState::Failed,
            RunOutcome::Aborted => EngineState::Aborted,
        };

        let mut state = run.state.into_inner().unwrap_or_else(|p| p.into_inner());
        state.finish(if outcome == RunOutcome::Completed {
            BuildStatus::Completed
        } else {
            BuildStatus::Failed
        });
        let progress = run.progress.into_inner().unwrap_or_else(|p| p.into_inner());
        let mut timings = run.timings.into_inner().unwrap_or_else(|p| p.into_inner());
        let stages: Vec<StageTiming> = registry
            .ordered_stages()
            .map(|stage| {
                timings.remove(&stage.id).unwrap_or_else(|| StageTiming {
                    stage_id: stage.id.clone(),
                    weight: stage.weight,
                    resolution: StageResolution::NotRun,
                    attempts: 0,
                    duration_ms: 0,
                })
            })
            .collect();

        let ctx = ReportContext {
            run_id: run.run_id,
            profile: &run.profile,
            outcome,
            started_at,
            finished_at: Utc::now(),
            state: &state,
            stages,
            recovery: run.decisions.into_inner().unwrap_or_else(|p| p.into_inner()),
        };
        let report = match &halted {
            Some(StageOutcome::Exhausted(failure)) | Some(StageOutcome::Aborted(failure)) => {
                generate_failure_report(
                    ctx,
                    FailureDetails {
                        stage_id: &failure.stage_id,
                        error_code: failure.error_code,
                        message: failure.message.clone(),
                        command: failure.command.clone(),
                        log_path: failure.log_path.as_deref(),
                    },
                )
            }
            _ => generate_report(ctx),
        };

        let layout = &self.config.layout;
        let report_path = write_report(&layout.reports_dir, &layout.latest_report, &report)?;
        obs::emit_run_finished(
            &run.run_id.to_string(),
            outcome.as_str(),
            report.duration_ms,
            state.progress_percent,
        );
        self.metrics.flush();
        if let Some(failure) = &report.failure {
            error!(
                stage = %failure.stage_id,
                error_code = %failure.error_code,
                report = %report_path.display(),
                "Run halted"
            );
        }

        Ok(RunSummary {
            run_id: run.run_id,
            outcome,
            report,
            report_path,
            progress_history: progress.history().to_vec(),
            metrics: self.metrics.snapshot(),
            state,
        })
    }

    fn invocation(&self, run: &RunContext, stage: &Stage, attempt: u32) -> Invocation {
        Invocation {
            stage_id: stage.id.clone(),
            executable: stage.executable.clone(),
            args: stage.args.clone(),
            build_root: self.config.layout.root.clone(),
            log_path: stage.resolved_log_path(&self.config.layout.logs_dir),
            timeout: stage.timeout,
            profile: run.profile.clone(),
            run_id: run.run_id,
            attempt,
        }
    }

    fn append(&self, run: &RunContext, stage: &Stage, status: CheckpointStatus, mut payload: CheckpointPayload) -> Result<()> {
        payload.profile = Some(run.profile.clone());
        self.store.append(&Checkpoint::new(&stage.id, status, payload))?;
        obs::emit_checkpoint_appended(&stage.id, status);
        Ok(())
    }

    fn skip(&self, run: &RunContext, stage: &Stage) -> Result<StageOutcome> {
        guard(&run.state).mark_skipped(&stage.id, stage.weight);
        guard(&run.progress).advance(stage.weight)?;
        run.resolve(stage, StageResolution::Skipped);
        self.metrics.inc_stages_skipped();
        obs::emit_stage_skipped(&stage.id, stage.weight);
        Ok(StageOutcome::Skipped)
    }

    // Another process may have completed the stage while we waited for the lock.
    fn completed_elsewhere(&self, stage: &Stage) -> Result<bool> {
        if !self.config.resume {
            return Ok(false);
        }
        Ok(self
            .store
            .latest_completed(&stage.id, Utc::now(), self.config.staleness_window())?
            .is_some())
    }

    fn complete(
        &self,
        run: &RunContext,
        stage: &Stage,
        attempt: u32,
        duration: Duration,
        recovered: Option<String>,
    ) -> Result<StageOutcome> {
        let mut payload = CheckpointPayload::new(run.run_id, attempt);
        payload.duration_ms = Some(duration.as_millis() as u64);
        payload.exit_code = recovered.is_none().then_some(0);
        payload.recovered = recovered.is_some();
        payload.note = recovered;
        let was_recovered = payload.recovered;
        self.append(run, stage, CheckpointStatus::Completed, payload)?;

        guard(&run.state).mark_completed(&stage.id, stage.weight);
        guard(&run.progress).advance(stage.weight)?;
        if was_recovered {
            run.resolve(stage, StageResolution::Recovered);
            Ok(StageOutcome::Recovered)
        } else {
            run.resolve(stage, StageResolution::Completed);
            Ok(StageOutcome::Completed)
        }
    }

    /// Wait for the build-root lock, giving up early on interrupt.
    async fn acquire_root_lock(&self, run: &RunContext) -> std::result::Result<LockGuard, ErrorCode> {
        let acquired = tokio::select! {
            acquired = self.locks.acquire(BUILD_ROOT_LOCK, self.config.lock_wait) => acquired,
            _ = cancelled(run.cancel.clone()) => return Err(ErrorCode::Aborted),
        };
        match acquired {
            Ok(lock) => {
                if let Some(previous) = lock.broke_stale_holder() {
                    self.metrics.inc_locks_broken();
                    obs::emit_lock_broken(lock.resource(), &previous.owner_id);
                }
                Ok(lock)
            }
            Err(e) => {
                warn!(error = %e, "Build-root lock unavailable");
                Err(e.code())
            }
        }
    }

    /// Acquire the lock for `stage`, treating contention as a stage failure
    /// that the recovery policy may retry.
    async fn lock_for(&self, run: &RunContext, stage: &Stage) -> Result<std::result::Result<LockGuard, StageOutcome>> {
        loop {
            let attempt_started = SystemTime::now();
            match self.acquire_root_lock(run).await {
                Ok(lock) => return Ok(Ok(lock)),
                Err(code) => {
                    let message = if code == ErrorCode::Aborted {
                        "interrupted while waiting for the build-root lock".to_string()
                    } else {
                        format!("build-root lock not acquired within {}s", self.config.lock_wait.as_secs())
                    };
                    run.record_attempt(stage, Duration::ZERO);
                    match self.fail_attempt(run, stage, code, message, attempt_started, None).await? {
                        Next::Retry => continue,
                        Next::Stop(outcome) => return Ok(Err(outcome)),
                    }
                }
            }
        }
    }

    /// Run one stage through attempts and recovery until it completes or stops.
    ///
    /// With `lock_held` the caller already owns the build-root lock for the
    /// whole unit; otherwise each attempt acquires and releases it.
    async fn drive_stage(&self, run: &RunContext, stage: &Stage, lock_held: bool) -> Result<StageOutcome> {
        if self.config.resume && guard(&run.state).is_completed(&stage.id) {
            return self.skip(run, stage);
        }

        loop {
            let lock = if lock_held {
                None
            } else {
                match self.lock_for(run, stage).await? {
                    Ok(lock) => Some(lock),
                    Err(outcome) => return Ok(outcome),
                }
            };
            if self.completed_elsewhere(stage)? {
                info!(stage = %stage.id, "Stage completed by another process while waiting");
                return self.skip(run, stage);
            }

            let attempt = {
                let mut state = guard(&run.state);
                state.mark_started(&stage.id);
                state.failures_for(&stage.id) + 1
            };
            self.append(run, stage, CheckpointStatus::Started, CheckpointPayload::new(run.run_id, attempt))?;
            obs::emit_stage_started(&stage.id, stage.weight, attempt);
            self.metrics.inc_stages_invoked();

            let invocation = self.invocation(run, stage, attempt);
            let execution = self.runner.invoke(&invocation, run.cancel.clone()).await?;
            run.record_attempt(stage, execution.duration);
            obs::emit_stage_finished(&stage.id, attempt, execution.passed(), execution.duration_ms());

            if execution.passed() {
                let outcome = self.complete(run, stage, attempt, execution.duration, None)?;
                drop(lock);
                return Ok(outcome);
            }

            drop(lock);
            let error = execution
                .error(&stage.id, stage.timeout)
                .unwrap_or_else(|| OrchestratorError::StageExecution {
                    stage_id: stage.id.clone(),
                    reason: "reported failure without an exit status".to_string(),
                });
            let (code, message) = (error.code(), error.to_string());
            let failure = AttemptFailure {
                exit_code: execution.exit_code(),
                duration: execution.duration,
                command: invocation.command_line(),
                log_path: invocation.log_path.clone(),
            };
            match self
                .fail_attempt(run, stage, code, message, execution.started_at, Some(failure))
                .await?
            {
                Next::Retry => continue,
                Next::Stop(outcome) => return Ok(outcome),
            }
        }
    }

    /// Record a failed attempt and ask the recovery policy what to do.
    async fn fail_attempt(
        &self,
        run: &RunContext,
        stage: &Stage,
        code: ErrorCode,
        message: String,
        attempt_started: SystemTime,
        attempt: Option<AttemptFailure>,
    ) -> Result<Next> {
        let failures = guard(&run.state).mark_failed(&stage.id);
        let mut payload = CheckpointPayload::new(run.run_id, failures);
        payload.error_code = Some(code);
        payload.exit_code = attempt.as_ref().and_then(|a| a.exit_code);
        payload.duration_ms = attempt.as_ref().map(|a| a.duration.as_millis() as u64);
        payload.note = Some(message.clone());
        self.append(run, stage, CheckpointStatus::Failed, payload)?;

        let (command, log_path) = match attempt {
            Some(a) => (a.command, Some(a.log_path)),
            None => (self.invocation(run, stage, failures).command_line(), None),
        };
        let stop = |code: ErrorCode, message: String| StageFailure {
            stage_id: stage.id.clone(),
            error_code: code,
            message,
            command: command.clone(),
            log_path: log_path.clone(),
        };

        if code == ErrorCode::Aborted {
            run.resolve(stage, StageResolution::Failed);
            return Ok(Next::Stop(StageOutcome::Aborted(stop(code, message))));
        }

        let decision = {
            let state = guard(&run.state);
            self.recovery.recover(
                &FailureContext {
                    stage_id: &stage.id,
                    error_code: code,
                    build_root: &self.config.layout.root,
                    attempt_started_at: attempt_started,
                },
                &state,
            )
        };
        obs::emit_recovery_decided(&decision);
        guard(&run.decisions).push(decision.clone());

        match decision.outcome {
            RecoveryOutcome::Succeeded => {
                let duration = SystemTime::now()
                    .duration_since(attempt_started)
                    .unwrap_or_default();
                let outcome = self.complete(run, stage, failures, duration, Some(decision.rationale))?;
                Ok(Next::Stop(outcome))
            }
            RecoveryOutcome::Retry(delay) => {
                self.metrics.inc_retries();
                debug!(stage = %stage.id, delay_ms = delay.as_millis() as u64, "Waiting before retry");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(Next::Retry),
                    _ = cancelled(run.cancel.clone()) => {
                        run.resolve(stage, StageResolution::Failed);
                        Ok(Next::Stop(StageOutcome::Aborted(stop(
                            ErrorCode::Aborted,
                            "interrupted while waiting to retry".to_string(),
                        ))))
                    }
                }
            }
            RecoveryOutcome::Exhausted => {
                run.resolve(stage, StageResolution::Failed);
                let exhausted = OrchestratorError::RecoveryExhausted {
                    stage_id: stage.id.clone(),
                    attempts: failures,
                    last_error: code,
                };
                Ok(Next::Stop(StageOutcome::Exhausted(stop(
                    code,
                    format!("{exhausted}: {message}"),
                ))))
            }
        }
    }

    /// Run a contiguous parallel group under one hold of the build-root lock.
    async fn drive_group(&self, run: &RunContext, name: &str, stages: &[&Stage]) -> Result<Vec<StageOutcome>> {
        let mut outcomes = Vec::new();
        let mut pending = Vec::new();
        for stage in stages {
            if self.config.resume && guard(&run.state).is_completed(&stage.id) {
                outcomes.push(self.skip(run, stage)?);
            } else {
                pending.push(*stage);
            }
        }
        if pending.is_empty() {
            return Ok(outcomes);
        }

        let lock = match self.lock_for(run, pending[0]).await? {
            Ok(lock) => lock,
            Err(outcome) => {
                outcomes.push(outcome);
                return Ok(outcomes);
            }
        };
        info!(group = %name, members = pending.len(), max_parallel = self.config.max_parallel, "Running parallel group");

        // Built up front so the stream holds plain futures, not a borrowing closure.
        let attempts: Vec<_> = pending
            .iter()
            .map(|stage| self.drive_stage(run, stage, true))
            .collect();
        let results: Vec<Result<StageOutcome>> = stream::iter(attempts)
            .buffer_unordered(self.config.max_parallel.max(1))
            .collect()
            .await;
        drop(lock);

        for result in results {
            outcomes.push(result?);
        }
        Ok(outcomes)
    }
}

/// Details of a failed process attempt, carried into the failure report.
struct AttemptFailure {
    exit_code: Option<i32>,
    duration: Duration,
    command: String,
    log_path: PathBuf,
}

/// Whether `exe` names an executable file, directly or via `PATH`.
fn is_resolvable(exe: &Path) -> bool {
    if exe.components().count() > 1 || exe.is_absolute() {
        return is_executable(exe);
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(exe))))
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
