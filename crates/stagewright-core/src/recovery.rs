//! Per-stage recovery strategies.
//!
//! Strategies are selected when the pipeline is loaded and looked up by stage
//! id at failure time. Each decision is a function of the stage id, the error
//! code and the current [`BuildState`]; error text is never inspected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::state::BuildState;

// Slack for filesystems whose mtime resolution is coarser than the attempt clock.
const FRESHNESS_SLACK: Duration = Duration::from_secs(1);

/// Decision returned for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Treat the stage as completed.
    Succeeded,
    /// Run the stage again after the delay.
    Retry(Duration),
    /// Give up; the engine halts.
    Exhausted,
}

/// Bounded exponential backoff: `delay = base * 2^n`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySchedule {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetrySchedule {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Outcome after `failures` failed attempts of the same stage in this run.
    pub fn decide(&self, failures: u32) -> RecoveryOutcome {
        if failures == 0 || failures > self.max_retries {
            RecoveryOutcome::Exhausted
        } else {
            RecoveryOutcome::Retry(self.delay_for(failures - 1))
        }
    }
}

/// Proof-of-completion check run against the build root after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceCheck {
    /// Paths relative to the build root that must all exist.
    pub paths: Vec<PathBuf>,
    /// Require each path to have been modified during the failed attempt.
    pub fresh: bool,
    /// Error codes for which evidence may override the failure.
    pub accept_on: Vec<ErrorCode>,
}

impl EvidenceCheck {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            fresh: true,
            accept_on: vec![ErrorCode::StageTimeout, ErrorCode::StageExecution],
        }
    }

    /// Whether every evidence path is present (and fresh, when required).
    pub fn is_satisfied(&self, build_root: &Path, attempt_started_at: SystemTime) -> bool {
        if self.paths.is_empty() {
            return false;
        }
        let threshold = attempt_started_at
            .checked_sub(FRESHNESS_SLACK)
            .unwrap_or(attempt_started_at);
        self.paths.iter().all(|rel| {
            let Ok(meta) = std::fs::metadata(build_root.join(rel)) else {
                return false;
            };
            if !self.fresh {
                return true;
            }
            meta.modified().map(|m| m >= threshold).unwrap_or(false)
        })
    }
}

/// The closed set of recovery behaviours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RecoveryStrategy {
    /// Retry with exponential backoff.
    Retry { schedule: RetrySchedule },
    /// Accept the failure if completion evidence exists, otherwise retry.
    Evidence {
        check: EvidenceCheck,
        schedule: RetrySchedule,
    },
    /// Fail immediately.
    NoRetry,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        RecoveryStrategy::Retry {
            schedule: RetrySchedule::default(),
        }
    }
}

impl RecoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry { .. } => "retry",
            RecoveryStrategy::Evidence { .. } => "evidence",
            RecoveryStrategy::NoRetry => "none",
        }
    }

    /// Declared capability: may this strategy turn a failure into success
    /// by inspecting the build root?
    pub fn verifies_evidence(&self) -> bool {
        matches!(self, RecoveryStrategy::Evidence { .. })
    }

    /// Decide what to do about the latest failure described by `ctx`.
    ///
    /// `state` must already count the failure being decided.
    pub fn decide(&self, ctx: &FailureContext<'_>, state: &BuildState) -> (RecoveryOutcome, String) {
        if !ctx.error_code.is_recoverable() {
            return (
                RecoveryOutcome::Exhausted,
                format!("{} failures are never retried", ctx.error_code),
            );
        }
        let failures = state.failures_for(ctx.stage_id);

        match self {
            RecoveryStrategy::NoRetry => (
                RecoveryOutcome::Exhausted,
                "strategy does not retry".to_string(),
            ),
            RecoveryStrategy::Retry { schedule } => retry_decision(schedule, failures),
            RecoveryStrategy::Evidence { check, schedule } => {
                if check.accept_on.contains(&ctx.error_code)
                    && check.is_satisfied(ctx.build_root, ctx.attempt_started_at)
                {
                    return (
                        RecoveryOutcome::Succeeded,
                        format!(
                            "completion evidence present despite {} ({} path(s))",
                            ctx.error_code,
                            check.paths.len()
                        ),
                    );
                }
                retry_decision(schedule, failures)
            }
        }
    }
}

fn retry_decision(schedule: &RetrySchedule, failures: u32) -> (RecoveryOutcome, String) {
    match schedule.decide(failures) {
        RecoveryOutcome::Retry(delay) => (
            RecoveryOutcome::Retry(delay),
            format!(
                "retry {failures}/{} after {}ms",
                schedule.max_retries,
                delay.as_millis()
            ),
        ),
        outcome => (
            outcome,
            format!("{failures} failure(s) exceed {} retries", schedule.max_retries),
        ),
    }
}

/// What the engine knows about a failed attempt.
#[derive(Debug, Clone)]
pub struct FailureContext<'a> {
    pub stage_id: &'a str,
    pub error_code: ErrorCode,
    pub build_root: &'a Path,
    pub attempt_started_at: SystemTime,
}

/// One auditable recovery decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub stage_id: String,
    pub attempt: u32,
    pub error_code: ErrorCode,
    pub strategy: String,
    pub outcome: RecoveryOutcome,
    pub rationale: String,
}

/// Map from stage id to strategy, with a fallback for unlisted stages.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPolicy {
    default: RecoveryStrategy,
    strategies: HashMap<String, RecoveryStrategy>,
}

impl RecoveryPolicy {
    pub fn new(default: RecoveryStrategy) -> Self {
        Self {
            default,
            strategies: HashMap::new(),
        }
    }

    pub fn with_strategy(mut self, stage_id: impl Into<String>, strategy: RecoveryStrategy) -> Self {
        self.set_strategy(stage_id, strategy);
        self
    }

    pub fn set_strategy(&mut self, stage_id: impl Into<String>, strategy: RecoveryStrategy) {
        self.strategies.insert(stage_id.into(), strategy);
    }

    pub fn strategy_for(&self, stage_id: &str) -> &RecoveryStrategy {
        self.strategies.get(stage_id).unwrap_or(&self.default)
    }

    /// Look up the stage's strategy and decide on the failure in `ctx`.
    pub fn recover(&self, ctx: &FailureContext<'_>, state: &BuildState) -> RecoveryDecision {
        let strategy = self.strategy_for(ctx.stage_id);
        let (outcome, rationale) = strategy.decide(ctx, state);
        RecoveryDecision {
            stage_id: ctx.stage_id.to_string(),
            attempt: state.failures_for(ctx.stage_id),
            error_code: ctx.error_code,
            strategy: strategy.name().to_string(),
            outcome,
            rationale,
        }
    }
}
