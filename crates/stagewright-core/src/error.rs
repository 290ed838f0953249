//! Error taxonomy for the orchestration engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stable, serializable classification of an [`OrchestratorError`].
///
/// Recovery strategies and reports consume codes, never error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    StageNotFound,
    StageTimeout,
    StageExecution,
    LockAcquisition,
    CheckpointCorruption,
    RecoveryExhausted,
    Aborted,
    Config,
    Io,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::StageNotFound => "stage_not_found",
            ErrorCode::StageTimeout => "stage_timeout",
            ErrorCode::StageExecution => "stage_execution",
            ErrorCode::LockAcquisition => "lock_acquisition",
            ErrorCode::CheckpointCorruption => "checkpoint_corruption",
            ErrorCode::RecoveryExhausted => "recovery_exhausted",
            ErrorCode::Aborted => "aborted",
            ErrorCode::Config => "config",
            ErrorCode::Io => "io",
        }
    }

    /// Whether stage-level failures with this code are offered to the recovery policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::StageTimeout | ErrorCode::StageExecution | ErrorCode::LockAcquisition
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("stage not found: {0}")]
    StageNotFound(String),

    #[error("stage {stage_id} timed out after {}s", timeout.as_secs())]
    StageTimeout { stage_id: String, timeout: Duration },

    #[error("stage {stage_id} failed: {reason}")]
    StageExecution { stage_id: String, reason: String },

    #[error("could not acquire lock {resource} within {}s (held by {holder})", waited.as_secs())]
    LockAcquisition {
        resource: String,
        holder: String,
        waited: Duration,
    },

    #[error("corrupted checkpoint record at line {line}: {reason}")]
    CheckpointCorruption { line: usize, reason: String },

    #[error("recovery exhausted for stage {stage_id} after {attempts} attempt(s): {last_error}")]
    RecoveryExhausted {
        stage_id: String,
        attempts: u32,
        last_error: ErrorCode,
    },

    #[error("weight {weight} is already owned by stage {existing}")]
    DuplicateWeight { weight: u8, existing: String },

    #[error("duplicate stage id: {0}")]
    DuplicateId(String),

    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("run aborted by interrupt")]
    Aborted,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("pipeline file parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::Validation(_) => ErrorCode::Validation,
            OrchestratorError::StageNotFound(_) => ErrorCode::StageNotFound,
            OrchestratorError::StageTimeout { .. } => ErrorCode::StageTimeout,
            OrchestratorError::StageExecution { .. } => ErrorCode::StageExecution,
            OrchestratorError::LockAcquisition { .. } => ErrorCode::LockAcquisition,
            OrchestratorError::CheckpointCorruption { .. } => ErrorCode::CheckpointCorruption,
            OrchestratorError::RecoveryExhausted { .. } => ErrorCode::RecoveryExhausted,
            OrchestratorError::DuplicateWeight { .. }
            | OrchestratorError::DuplicateId(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Toml(_) => ErrorCode::Config,
            OrchestratorError::Aborted => ErrorCode::Aborted,
            OrchestratorError::Serialization(_) | OrchestratorError::Io(_) => ErrorCode::Io,
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
