//! stagewright core library
//!
//! Resumable orchestration of weighted build stages against a shared build
//! root: durable checkpoints, a build-root lock, per-stage recovery
//! strategies and versioned run reports.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod maintenance;
pub mod metrics;
pub mod obs;
pub mod progress;
pub mod recovery;
pub mod registry;
pub mod report;
pub mod runner;
pub mod state;
pub mod telemetry;

pub use checkpoint::{
    authoritative_completions, validate_checkpoint, Checkpoint, CheckpointPayload,
    CheckpointStatus, CheckpointStore, CheckpointValidity, LoadedLog, PAYLOAD_VERSION,
};
pub use config::{
    ConfigOverrides, EngineConfig, Layout, Pipeline, PipelineFile, DEFAULT_PROFILE,
    DEFAULT_PROFILES, PIPELINE_FILE, STATE_DIR,
};
pub use engine::{EngineState, ExecutionEngine, RunSummary};
pub use error::{ErrorCode, OrchestratorError, Result};
pub use lock::{LockGuard, LockInfo, LockManager, BUILD_ROOT_LOCK};
pub use maintenance::{clean, inspect, render_status, CleanSummary, StageStatus, StatusView};
pub use metrics::{Metrics, MetricsSnapshot};
pub use progress::{read_progress, ProgressTracker};
pub use recovery::{
    EvidenceCheck, FailureContext, RecoveryDecision, RecoveryOutcome, RecoveryPolicy,
    RecoveryStrategy, RetrySchedule,
};
pub use registry::{ExecutionUnit, Stage, StageRegistry};
pub use report::{
    read_latest_report, render_summary, FailureReport, MissionReport, RunOutcome,
    StageResolution, StageTiming,
};
pub use runner::{ExitDisposition, Invocation, ProcessStageRunner, StageExecution, StageRunner};
pub use state::{BuildPhase, BuildState, BuildStatus};
pub use telemetry::init_tracing;
