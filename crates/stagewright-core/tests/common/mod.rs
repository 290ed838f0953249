//! Shared fixtures: a temporary build root and `/bin/sh` stage scripts that
//! count their own invocations.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stagewright_core::{
    EngineConfig, ExecutionEngine, Pipeline, ProcessStageRunner, RecoveryPolicy, Stage,
    StageRegistry,
};
use tempfile::TempDir;

pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("root")).unwrap();
        fs::create_dir_all(dir.path().join("scripts")).unwrap();
        fs::create_dir_all(dir.path().join("counts")).unwrap();
        Self { dir }
    }

    /// The build root handed to every stage.
    pub fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::new(self.root())
    }

    /// Write a stage script. Scripts run as `/bin/sh <script> <root>`, so the
    /// build root is `$1`.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join("scripts").join(format!("{name}.sh"));
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    /// A stage whose script records each invocation before running `body`.
    pub fn stage(&self, id: &str, weight: u8, body: &str) -> Stage {
        let counter = self.counter_path(id);
        let script = self.script(
            id,
            &format!("echo run >> '{}'\n{body}", counter.display()),
        );
        Stage::new(id, weight, "/bin/sh").with_args(vec![script.display().to_string()])
    }

    /// Like [`Workspace::stage`] with a timeout.
    pub fn timed_stage(&self, id: &str, weight: u8, body: &str, timeout: Duration) -> Stage {
        self.stage(id, weight, body).with_timeout(timeout)
    }

    /// Replace the body of an existing stage script, keeping its counter.
    pub fn rewrite(&self, id: &str, body: &str) {
        let counter = self.counter_path(id);
        self.script(id, &format!("echo run >> '{}'\n{body}", counter.display()));
    }

    pub fn invocations(&self, id: &str) -> usize {
        fs::read_to_string(self.counter_path(id))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn counter_path(&self, id: &str) -> PathBuf {
        self.dir.path().join("counts").join(id)
    }
}

pub fn registry(stages: Vec<Stage>) -> StageRegistry {
    let mut registry = StageRegistry::new();
    for stage in stages {
        registry.register(stage).unwrap();
    }
    registry
}

pub fn engine(config: EngineConfig, registry: StageRegistry, recovery: RecoveryPolicy) -> ExecutionEngine {
    let runner = ProcessStageRunner::new().with_kill_grace(Duration::from_millis(500));
    ExecutionEngine::new(config, Pipeline { registry, recovery }, Arc::new(runner)).unwrap()
}

pub fn assert_monotonic(history: &[u8]) {
    assert!(
        history.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {history:?}"
    );
}

pub fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
}
