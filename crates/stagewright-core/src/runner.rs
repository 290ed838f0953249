//! Stage invocation across the process boundary.
//!
//! [`StageRunner`] is the seam between the engine and child processes.
//! [`ProcessStageRunner`] starts each stage in its own process group so a
//! timeout or interrupt can take down everything the stage spawned.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::report::read_tail;

/// Grace period between SIGTERM and SIGKILL on interrupt.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Interval between "still running" events.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

const FAILURE_TAIL_LINES: usize = 20;

/// Everything needed to start one attempt of one stage.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage_id: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub build_root: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub profile: String,
    pub run_id: Uuid,
    /// 1-based attempt number within this run.
    pub attempt: u32,
}

impl Invocation {
    /// Human-readable command line, as recorded in failure reports.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.executable.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.push(self.build_root.display().to_string());
        parts.join(" ")
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExitDisposition {
    Success,
    /// Non-zero exit. `exit_code` is `None` when the process died from a
    /// signal or could not be started.
    Failed { exit_code: Option<i32> },
    TimedOut,
    Aborted,
}

/// Result of one attempt.
#[derive(Debug, Clone)]
pub struct StageExecution {
    pub stage_id: String,
    pub attempt: u32,
    pub disposition: ExitDisposition,
    pub started_at: SystemTime,
    pub duration: Duration,
}

impl StageExecution {
    pub fn passed(&self) -> bool {
        self.disposition == ExitDisposition::Success
    }

    /// The error a failed attempt amounts to; `None` on success.
    pub fn error(&self, stage_id: &str, timeout: Duration) -> Option<OrchestratorError> {
        let stage_id = stage_id.to_string();
        match self.disposition {
            ExitDisposition::Success => None,
            ExitDisposition::Failed { exit_code: Some(code) } => Some(OrchestratorError::StageExecution {
                stage_id,
                reason: format!("exited with status {code}"),
            }),
            ExitDisposition::Failed { exit_code: None } => Some(OrchestratorError::StageExecution {
                stage_id,
                reason: "terminated by signal or failed to start".to_string(),
            }),
            ExitDisposition::TimedOut => Some(OrchestratorError::StageTimeout { stage_id, timeout }),
            ExitDisposition::Aborted => Some(OrchestratorError::Aborted),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.disposition {
            ExitDisposition::Success => Some(0),
            ExitDisposition::Failed { exit_code } => exit_code,
            _ => None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Runs one stage attempt to completion, timeout or cancellation.
///
/// `cancel` flips to `true` when the run is interrupted; implementations
/// must stop the stage promptly and report [`ExitDisposition::Aborted`].
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: watch::Receiver<bool>,
    ) -> Result<StageExecution>;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessStageRunner {
    heartbeat: Duration,
    kill_grace: Duration,
}

impl Default for ProcessStageRunner {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl ProcessStageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn spawn(&self, inv: &Invocation) -> Result<Child> {
        if let Some(parent) = inv.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inv.log_path)?;
        writeln!(
            log,
            "==> {} stage={} attempt={} run={}",
            Utc::now().to_rfc3339(),
            inv.stage_id,
            inv.attempt,
            inv.run_id
        )?;
        let stderr = log.try_clone()?;

        let child = Command::new(&inv.executable)
            .args(&inv.args)
            .arg(&inv.build_root)
            .current_dir(&inv.build_root)
            .env("STAGEWRIGHT_ROOT", &inv.build_root)
            .env("STAGEWRIGHT_STAGE", &inv.stage_id)
            .env("STAGEWRIGHT_PROFILE", &inv.profile)
            .env("STAGEWRIGHT_RUN_ID", inv.run_id.to_string())
            .env("STAGEWRIGHT_ATTEMPT", inv.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

enum Ended {
    Exited(ExitStatus),
    TimedOut,
    Aborted,
}

#[async_trait]
impl StageRunner for ProcessStageRunner {
    async fn invoke(
        &self,
        inv: &Invocation,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<StageExecution> {
        let started_at = SystemTime::now();
        let clock = Instant::now();

        let finish = |disposition: ExitDisposition| StageExecution {
            stage_id: inv.stage_id.clone(),
            attempt: inv.attempt,
            disposition,
            started_at,
            duration: clock.elapsed(),
        };

        if *cancel.borrow() {
            return Ok(finish(ExitDisposition::Aborted));
        }

        let mut child = match self.spawn(inv) {
            Ok(child) => child,
            Err(e) => {
                error!(stage = %inv.stage_id, command = %inv.command_line(), error = %e, "Failed to start stage");
                return Ok(finish(ExitDisposition::Failed { exit_code: None }));
            }
        };
        let group = child.id().map(|pid| Pid::from_raw(pid as i32));
        debug!(stage = %inv.stage_id, pid = ?child.id(), timeout_secs = inv.timeout.as_secs(), "Stage process started");

        let deadline = tokio::time::sleep(inv.timeout);
        tokio::pin!(deadline);
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + self.heartbeat, self.heartbeat);
        let mut cancel_open = true;

        let ended = loop {
            tokio::select! {
                status = child.wait() => break Ended::Exited(status?),
                _ = &mut deadline => {
                    warn!(stage = %inv.stage_id, timeout_secs = inv.timeout.as_secs(), "Stage timed out; killing process group");
                    signal_group(group, Signal::SIGKILL);
                    let _ = child.wait().await;
                    break Ended::TimedOut;
                }
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel.borrow() => {
                        warn!(stage = %inv.stage_id, "Interrupt received; terminating stage");
                        terminate_group(&mut child, group, self.kill_grace).await;
                        break Ended::Aborted;
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },
                _ = heartbeat.tick() => {
                    info!(stage = %inv.stage_id, elapsed_secs = clock.elapsed().as_secs(), "Stage still running");
                }
            }
        };

        let disposition = match ended {
            Ended::Exited(status) if status.success() => ExitDisposition::Success,
            Ended::Exited(status) => ExitDisposition::Failed {
                exit_code: status.code(),
            },
            Ended::TimedOut => ExitDisposition::TimedOut,
            Ended::Aborted => ExitDisposition::Aborted,
        };
        // Reap anything the stage left behind in its group.
        if disposition != ExitDisposition::Success {
            signal_group(group, Signal::SIGKILL);
        }

        let execution = finish(disposition);
        if execution.passed() {
            info!(stage = %inv.stage_id, duration_ms = execution.duration_ms(), "Stage exited successfully");
        } else {
            error!(
                stage = %inv.stage_id,
                disposition = ?execution.disposition,
                duration_ms = execution.duration_ms(),
                log = %inv.log_path.display(),
                "Stage failed"
            );
            for line in read_tail(&inv.log_path, FAILURE_TAIL_LINES) {
                error!(stage = %inv.stage_id, "| {line}");
            }
        }
        Ok(execution)
    }
}

fn signal_group(group: Option<Pid>, signal: Signal) {
    let Some(pgid) = group else { return };
    match killpg(pgid, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid = %pgid, signal = %signal, error = %e, "Failed to signal process group"),
    }
}

async fn terminate_group(child: &mut Child, group: Option<Pid>, grace: Duration) {
    signal_group(group, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        signal_group(group, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    // Scripts run through the shell so no test execs a file another thread
    // may still hold open for writing.
    fn invocation(root: &Path, script: PathBuf, timeout: Duration) -> Invocation {
        Invocation {
            stage_id: "unit".to_string(),
            executable: PathBuf::from("/bin/sh"),
            args: vec![script.display().to_string()],
            build_root: root.to_path_buf(),
            log_path: root.join("logs/unit.log"),
            timeout,
            profile: "standard".to_string(),
            run_id: Uuid::nil(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_success_captures_output_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "ok.sh", r#"echo "root=$1 stage=$STAGEWRIGHT_STAGE profile=$STAGEWRIGHT_PROFILE""#);
        let inv = invocation(dir.path(), exe, Duration::from_secs(10));
        let (_tx, rx) = watch::channel(false);

        let result = ProcessStageRunner::new().invoke(&inv, rx).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.exit_code(), Some(0));

        let log = fs::read_to_string(&inv.log_path).unwrap();
        assert!(log.contains("==> "));
        assert!(log.contains(&format!("root={}", dir.path().display())));
        assert!(log.contains("stage=unit profile=standard"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "fail.sh", "echo boom >&2\nexit 3");
        let inv = invocation(dir.path(), exe, Duration::from_secs(10));
        let (_tx, rx) = watch::channel(false);

        let result = ProcessStageRunner::new().invoke(&inv, rx).await.unwrap();
        assert_eq!(result.disposition, ExitDisposition::Failed { exit_code: Some(3) });
        let err = result.error("unit", inv.timeout).unwrap();
        assert_eq!(err.code(), ErrorCode::StageExecution);
        assert_eq!(err.to_string(), "stage unit failed: exited with status 3");
        assert!(fs::read_to_string(&inv.log_path).unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "slow.sh", "sleep 10 &\nwait");
        let inv = invocation(dir.path(), exe, Duration::from_secs(1));
        let (_tx, rx) = watch::channel(false);

        let started = Instant::now();
        let result = ProcessStageRunner::new().invoke(&inv, rx).await.unwrap();
        assert_eq!(result.disposition, ExitDisposition::TimedOut);
        let err = result.error("unit", inv.timeout).unwrap();
        assert_eq!(err.code(), ErrorCode::StageTimeout);
        assert!(err.to_string().contains("timed out after 1s"));
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_stage() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "sleepy.sh", "sleep 30");
        let inv = invocation(dir.path(), exe, Duration::from_secs(60));
        let (tx, rx) = watch::channel(false);

        let runner = ProcessStageRunner::new().with_kill_grace(Duration::from_millis(500));
        let handle = tokio::spawn(async move { runner.invoke(&inv, rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.disposition, ExitDisposition::Aborted);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation(dir.path(), PathBuf::new(), Duration::from_secs(1));
        inv.executable = dir.path().join("absent");
        inv.args.clear();
        let (_tx, rx) = watch::channel(false);
        let result = ProcessStageRunner::new().invoke(&inv, rx).await.unwrap();
        assert_eq!(result.disposition, ExitDisposition::Failed { exit_code: None });
    }
}
