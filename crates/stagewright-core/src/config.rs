//! Pipeline file parsing and resolved engine configuration.
//!
//! Precedence: built-in defaults, then the pipeline file's `[engine]` table,
//! then [`ConfigOverrides`] (environment and flags, resolved by the binary).
//! The engine itself never reads the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::recovery::{EvidenceCheck, RecoveryPolicy, RecoveryStrategy, RetrySchedule};
use crate::registry::{Stage, StageRegistry};

/// Bookkeeping directory under the working root.
pub const STATE_DIR: &str = ".stagewright";

/// Pipeline file looked up in the working root when none is given.
pub const PIPELINE_FILE: &str = "stagewright.toml";

pub const DEFAULT_PROFILE: &str = "standard";

pub const DEFAULT_PROFILES: [&str; 5] = [
    "minimal",
    "standard",
    "development",
    "zfs_optimized",
    "security",
];

/// Locations of everything the engine persists under the working root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub checkpoint_log: PathBuf,
    pub progress_marker: PathBuf,
    pub locks_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub latest_report: PathBuf,
}

impl Layout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join(STATE_DIR);
        Self {
            checkpoint_log: state_dir.join("checkpoints.log"),
            progress_marker: state_dir.join("progress"),
            locks_dir: state_dir.join("locks"),
            logs_dir: state_dir.join("logs"),
            reports_dir: state_dir.join("reports"),
            latest_report: state_dir.join("report.json"),
            state_dir,
            root,
        }
    }

    /// Create the bookkeeping directories.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.state_dir, &self.locks_dir, &self.logs_dir, &self.reports_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// `[engine]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub default_timeout_secs: u64,
    pub staleness_hours: u64,
    pub max_parallel: usize,
    pub lock_wait_secs: u64,
    pub lock_stale_secs: u64,
    pub heartbeat_secs: u64,
    /// Directories (relative to the root) that must exist before any stage runs.
    pub required_dirs: Vec<PathBuf>,
    pub profiles: Vec<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 3600,
            staleness_hours: 24,
            max_parallel: 1,
            lock_wait_secs: 30,
            lock_stale_secs: 600,
            heartbeat_secs: 60,
            required_dirs: Vec::new(),
            profiles: DEFAULT_PROFILES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Retry,
    Evidence,
    None,
}

/// A recovery strategy table (`[recovery.default]` or a stage's `recovery`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub fresh: Option<bool>,
    #[serde(default)]
    pub accept_on: Option<Vec<ErrorCode>>,
}

impl StrategyConfig {
    fn schedule(&self) -> RetrySchedule {
        let defaults = RetrySchedule::default();
        RetrySchedule::new(
            self.max_retries.unwrap_or(defaults.max_retries),
            self.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            self.max_delay_ms.unwrap_or(defaults.max_delay_ms),
        )
    }

    pub fn into_strategy(&self, owner: &str) -> Result<RecoveryStrategy> {
        match self.kind {
            StrategyKind::None => Ok(RecoveryStrategy::NoRetry),
            StrategyKind::Retry => Ok(RecoveryStrategy::Retry {
                schedule: self.schedule(),
            }),
            StrategyKind::Evidence => {
                if self.paths.is_empty() {
                    return Err(OrchestratorError::Config(format!(
                        "{owner}: evidence strategy needs at least one path"
                    )));
                }
                if let Some(path) = self.paths.iter().find(|p| p.is_absolute()) {
                    return Err(OrchestratorError::Config(format!(
                        "{owner}: evidence path {} must be relative to the build root",
                        path.display()
                    )));
                }
                let mut check = EvidenceCheck::new(self.paths.clone());
                if let Some(fresh) = self.fresh {
                    check.fresh = fresh;
                }
                if let Some(codes) = &self.accept_on {
                    if let Some(code) = codes
                        .iter()
                        .find(|c| matches!(c, ErrorCode::LockAcquisition | ErrorCode::Aborted))
                    {
                        return Err(OrchestratorError::Config(format!(
                            "{owner}: {code} can never be accepted as evidence of completion"
                        )));
                    }
                    check.accept_on = codes.clone();
                }
                Ok(RecoveryStrategy::Evidence {
                    check,
                    schedule: self.schedule(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoverySection {
    pub default: Option<StrategyConfig>,
}

/// One `[[stage]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSection {
    pub id: String,
    pub weight: u8,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub log: Option<PathBuf>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub recovery: Option<StrategyConfig>,
}

/// Parsed pipeline file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageSection>,
    /// Directory relative executables resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Registry and recovery policy built from a pipeline file.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub registry: StageRegistry,
    pub recovery: RecoveryPolicy,
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("cannot read pipeline file {}: {e}", path.display()))
        })?;
        let mut file = Self::parse(&content)?;
        file.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(file)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: PipelineFile = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.engine.max_parallel == 0 {
            errors.push("engine.max_parallel must be greater than 0".to_string());
        }
        if self.engine.default_timeout_secs == 0 {
            errors.push("engine.default_timeout_secs must be greater than 0".to_string());
        }
        if self.engine.heartbeat_secs == 0 {
            errors.push("engine.heartbeat_secs must be greater than 0".to_string());
        }
        if self.engine.profiles.is_empty() {
            errors.push("engine.profiles must not be empty".to_string());
        }
        for stage in &self.stages {
            if stage.timeout_secs == Some(0) {
                errors.push(format!("stage {}: timeout_secs must be greater than 0", stage.id));
            }
            for profile in &stage.profiles {
                if !self.engine.profiles.contains(profile) {
                    errors.push(format!("stage {}: unknown profile {profile}", stage.id));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Config(errors.join("; ")))
        }
    }

    /// Build the stage registry and recovery policy.
    ///
    /// `default_timeout` applies to stages without their own `timeout_secs`.
    pub fn build(&self, default_timeout: Duration) -> Result<Pipeline> {
        let default = match &self.recovery.default {
            Some(cfg) => cfg.into_strategy("recovery.default")?,
            None => RecoveryStrategy::default(),
        };
        let mut recovery = RecoveryPolicy::new(default);
        let mut registry = StageRegistry::new();

        for section in &self.stages {
            let timeout = section
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);
            let mut stage = Stage::new(&section.id, section.weight, self.resolve_executable(&section.executable))
                .with_args(section.args.clone())
                .with_timeout(timeout)
                .for_profiles(section.profiles.clone());
            if let Some(log) = &section.log {
                stage = stage.with_log_path(log);
            }
            if let Some(group) = &section.group {
                stage = stage.in_group(group);
            }
            registry.register(stage)?;

            if let Some(cfg) = &section.recovery {
                recovery.set_strategy(&section.id, cfg.into_strategy(&format!("stage {}", section.id))?);
            }
        }

        registry.execution_units()?;
        Ok(Pipeline { registry, recovery })
    }

    // Bare names are looked up on PATH at validation time.
    fn resolve_executable(&self, exe: &Path) -> PathBuf {
        if exe.is_absolute() || exe.components().count() == 1 {
            exe.to_path_buf()
        } else {
            self.base_dir.join(exe)
        }
    }
}

/// Values supplied by environment variables or flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub max_parallel: Option<usize>,
    pub stage_timeout_secs: Option<u64>,
    pub staleness_hours: Option<u64>,
    pub resume: Option<bool>,
}

/// Fully resolved engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub layout: Layout,
    pub default_timeout: Duration,
    pub staleness: Duration,
    pub max_parallel: usize,
    pub lock_wait: Duration,
    pub lock_staleness: Duration,
    pub heartbeat: Duration,
    pub required_dirs: Vec<PathBuf>,
    pub profiles: Vec<String>,
    /// Honor existing completion checkpoints.
    pub resume: bool,
}

impl EngineConfig {
    /// Defaults for `root` without any pipeline file.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::from_section(root, &EngineSection::default())
    }

    pub fn from_section(root: impl AsRef<Path>, section: &EngineSection) -> Self {
        Self {
            layout: Layout::new(root),
            default_timeout: Duration::from_secs(section.default_timeout_secs),
            staleness: hours(section.staleness_hours),
            max_parallel: section.max_parallel,
            lock_wait: Duration::from_secs(section.lock_wait_secs),
            lock_staleness: Duration::from_secs(section.lock_stale_secs),
            heartbeat: Duration::from_secs(section.heartbeat_secs),
            required_dirs: section.required_dirs.clone(),
            profiles: section.profiles.clone(),
            resume: true,
        }
    }

    /// Apply overrides on top of the file-derived values.
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Result<Self> {
        if let Some(n) = overrides.max_parallel {
            if n == 0 {
                return Err(OrchestratorError::Config("max parallel must be greater than 0".into()));
            }
            self.max_parallel = n;
        }
        if let Some(secs) = overrides.stage_timeout_secs {
            if secs == 0 {
                return Err(OrchestratorError::Config("stage timeout must be greater than 0".into()));
            }
            self.default_timeout = Duration::from_secs(secs);
        }
        if let Some(h) = overrides.staleness_hours {
            self.staleness = hours(h);
        }
        if let Some(resume) = overrides.resume {
            self.resume = resume;
        }
        Ok(self)
    }

    /// The staleness threshold as a checkpoint-age bound. Absurdly large
    /// thresholds clamp to roughly a thousand years.
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.staleness).unwrap_or_else(|_| chrono::Duration::weeks(52 * 1000))
    }

    pub fn knows_profile(&self, profile: &str) -> bool {
        self.profiles.iter().any(|p| p == profile)
    }
}

// Saturates so an oversized hour count means "never stale" instead of overflowing.
fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}
