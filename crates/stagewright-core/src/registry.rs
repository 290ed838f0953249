//! Stage descriptors and the weight-ordered stage registry.
//!
//! Ordering by weight is the only dependency mechanism: a stage is presumed
//! to require every lower-weight stage to have completed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Default per-stage timeout when neither the stage nor the engine sets one.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Immutable description of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Unique id, restricted to `[A-Za-z0-9_.-]`.
    pub id: String,

    /// Position in the pipeline and progress percentage (0-100).
    pub weight: u8,

    /// Executable to invoke; the build root is appended as the last argument.
    pub executable: PathBuf,

    /// Arguments placed before the build root.
    pub args: Vec<String>,

    /// Wall-clock limit for one attempt.
    pub timeout: Duration,

    /// Output capture file. Relative paths resolve against the logs directory.
    pub log_path: PathBuf,

    /// Parallel group; contiguous stages sharing a group may run concurrently.
    pub group: Option<String>,

    /// Profiles this stage runs under. Empty means every profile.
    pub profiles: Vec<String>,
}

impl Stage {
    pub fn new(id: impl Into<String>, weight: u8, executable: impl Into<PathBuf>) -> Self {
        let id = id.into();
        let log_path = PathBuf::from(format!("{id}.log"));
        Self {
            id,
            weight,
            executable: executable.into(),
            args: Vec::new(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            log_path,
            group: None,
            profiles: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn for_profiles(mut self, profiles: Vec<String>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Whether this stage participates in a build with `profile`.
    pub fn runs_under(&self, profile: &str) -> bool {
        self.profiles.is_empty() || self.profiles.iter().any(|p| p == profile)
    }

    /// Absolute log location given the run's logs directory.
    pub fn resolved_log_path(&self, logs_dir: &Path) -> PathBuf {
        if self.log_path.is_absolute() {
            self.log_path.clone()
        } else {
            logs_dir.join(&self.log_path)
        }
    }
}

/// Check a stage id against the allowed character set.
pub fn is_valid_stage_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// A unit the engine schedules: one stage, or a contiguous parallel group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionUnit<'a> {
    Single(&'a Stage),
    Group { name: String, stages: Vec<&'a Stage> },
}

impl<'a> ExecutionUnit<'a> {
    pub fn stages(&self) -> Vec<&'a Stage> {
        match self {
            ExecutionUnit::Single(stage) => vec![*stage],
            ExecutionUnit::Group { stages, .. } => stages.clone(),
        }
    }
}

/// Weight-ordered table of stages. Built once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    by_weight: BTreeMap<u8, Stage>,
    weight_of: HashMap<String, u8>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage. Weights and ids must both be unique.
    pub fn register(&mut self, stage: Stage) -> Result<()> {
        if !is_valid_stage_id(&stage.id) {
            return Err(OrchestratorError::Config(format!(
                "stage id {:?} must match [A-Za-z0-9_.-]+",
                stage.id
            )));
        }
        if stage.weight > 100 {
            return Err(OrchestratorError::Config(format!(
                "stage {} has weight {} (must be 0-100)",
                stage.id, stage.weight
            )));
        }
        if self.weight_of.contains_key(&stage.id) {
            return Err(OrchestratorError::DuplicateId(stage.id));
        }
        if let Some(existing) = self.by_weight.get(&stage.weight) {
            return Err(OrchestratorError::DuplicateWeight {
                weight: stage.weight,
                existing: existing.id.clone(),
            });
        }
        self.weight_of.insert(stage.id.clone(), stage.weight);
        self.by_weight.insert(stage.weight, stage);
        Ok(())
    }

    /// Stages sorted by weight ascending.
    pub fn ordered_stages(&self) -> impl Iterator<Item = &Stage> + '_ {
        self.by_weight.values()
    }

    pub fn lookup(&self, id: &str) -> Result<&Stage> {
        self.weight_of
            .get(id)
            .and_then(|w| self.by_weight.get(w))
            .ok_or_else(|| OrchestratorError::StageNotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_weight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_weight.is_empty()
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.ordered_stages().map(|s| s.id.clone()).collect()
    }

    /// Copy of the registry restricted to stages that run under `profile`.
    pub fn for_profile(&self, profile: &str) -> StageRegistry {
        let mut filtered = StageRegistry::new();
        for stage in self.ordered_stages().filter(|s| s.runs_under(profile)) {
            filtered.weight_of.insert(stage.id.clone(), stage.weight);
            filtered.by_weight.insert(stage.weight, stage.clone());
        }
        filtered
    }

    /// Partition the ordered stages into scheduling units.
    ///
    /// Fails if a group name reappears after a different stage interrupted it.
    pub fn execution_units(&self) -> Result<Vec<ExecutionUnit<'_>>> {
        let mut units: Vec<ExecutionUnit<'_>> = Vec::new();
        let mut closed_groups: Vec<String> = Vec::new();

        for stage in self.ordered_stages() {
            if let Some(ExecutionUnit::Group { name, stages }) = units.last_mut() {
                if stage.group.as_deref() == Some(name.as_str()) {
                    stages.push(stage);
                    continue;
                }
                closed_groups.push(name.clone());
            }

            match stage.group.as_deref() {
                None => units.push(ExecutionUnit::Single(stage)),
                Some(group) if closed_groups.iter().any(|g| g == group) => {
                    return Err(OrchestratorError::Config(format!(
                        "parallel group {group} is not contiguous (stage {} at weight {})",
                        stage.id, stage.weight
                    )));
                }
                Some(group) => units.push(ExecutionUnit::Group {
                    name: group.to_string(),
                    stages: vec![stage],
                }),
            }
        }

        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(stages: Vec<Stage>) -> StageRegistry {
        let mut reg = StageRegistry::new();
        for stage in stages {
            reg.register(stage).unwrap();
        }
        reg
    }

    #[test]
    fn test_ordered_by_weight_regardless_of_insert_order() {
        let reg = registry(vec![
            Stage::new("image", 90, "/bin/true"),
            Stage::new("bootstrap", 10, "/bin/true"),
            Stage::new("packages", 40, "/bin/true"),
        ]);
        assert_eq!(reg.stage_ids(), vec!["bootstrap", "packages", "image"]);
    }

    #[test]
    fn test_duplicate_weight_rejected() {
        let mut reg = registry(vec![Stage::new("bootstrap", 10, "/bin/true")]);
        let err = reg.register(Stage::new("other", 10, "/bin/true")).unwrap_err();
        match err {
            OrchestratorError::DuplicateWeight { weight, existing } => {
                assert_eq!(weight, 10);
                assert_eq!(existing, "bootstrap");
            }
            other => panic!("expected DuplicateWeight, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut reg = registry(vec![Stage::new("bootstrap", 10, "/bin/true")]);
        let err = reg.register(Stage::new("bootstrap", 20, "/bin/true")).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateId(id) if id == "bootstrap"));
    }

    #[test]
    fn test_invalid_id_and_weight_rejected() {
        let mut reg = StageRegistry::new();
        assert!(reg.register(Stage::new("has:colon", 10, "/bin/true")).is_err());
        assert!(reg.register(Stage::new("", 10, "/bin/true")).is_err());
        assert!(reg.register(Stage::new("too-heavy", 101, "/bin/true")).is_err());
    }

    #[test]
    fn test_lookup_missing_stage() {
        let reg = registry(vec![Stage::new("bootstrap", 10, "/bin/true")]);
        assert_eq!(reg.lookup("bootstrap").unwrap().weight, 10);
        let err = reg.lookup("kernel").unwrap_err();
        assert!(matches!(err, OrchestratorError::StageNotFound(id) if id == "kernel"));
    }

    #[test]
    fn test_profile_filter_keeps_order() {
        let reg = registry(vec![
            Stage::new("bootstrap", 10, "/bin/true"),
            Stage::new("zfs", 30, "/bin/true").for_profiles(vec!["zfs_optimized".into()]),
            Stage::new("image", 90, "/bin/true"),
        ]);
        assert_eq!(reg.for_profile("standard").stage_ids(), vec!["bootstrap", "image"]);
        assert_eq!(
            reg.for_profile("zfs_optimized").stage_ids(),
            vec!["bootstrap", "zfs", "image"]
        );
    }

    #[test]
    fn test_execution_units_group_contiguous_stages() {
        let reg = registry(vec![
            Stage::new("bootstrap", 10, "/bin/true"),
            Stage::new("fonts", 20, "/bin/true").in_group("extras"),
            Stage::new("docs", 25, "/bin/true").in_group("extras"),
            Stage::new("image", 90, "/bin/true"),
        ]);
        let units = reg.execution_units().unwrap();
        assert_eq!(units.len(), 3);
        match &units[1] {
            ExecutionUnit::Group { name, stages } => {
                assert_eq!(name, "extras");
                assert_eq!(stages.len(), 2);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn test_non_contiguous_group_rejected() {
        let reg = registry(vec![
            Stage::new("fonts", 20, "/bin/true").in_group("extras"),
            Stage::new("kernel", 30, "/bin/true"),
            Stage::new("docs", 40, "/bin/true").in_group("extras"),
        ]);
        let err = reg.execution_units().unwrap_err();
        assert!(err.to_string().contains("not contiguous"));
    }

    #[test]
    fn test_log_path_resolution() {
        let stage = Stage::new("kernel", 50, "/bin/true");
        assert_eq!(
            stage.resolved_log_path(Path::new("/work/logs")),
            PathBuf::from("/work/logs/kernel.log")
        );
        let stage = stage.with_log_path("/var/log/kernel.log");
        assert_eq!(
            stage.resolved_log_path(Path::new("/work/logs")),
            PathBuf::from("/var/log/kernel.log")
        );
    }
}
