//! stagewright - resumable build pipeline orchestrator
//!
//! ## Commands
//!
//! - `build [profile]`: validate, then run every stage not already completed
//! - `validate [profile]`: pre-flight checks only
//! - `status`: replay the checkpoint log and show per-stage state
//! - `clean [--all]`: clear checkpoints, progress and stage logs
//!
//! Exit codes: 0 success, 1 validation or stage failure, 130 interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use stagewright_core::{
    clean, init_tracing, inspect, render_status, render_summary, ConfigOverrides, EngineConfig,
    ExecutionEngine, Pipeline, PipelineFile, ProcessStageRunner, DEFAULT_PROFILE, PIPELINE_FILE,
};

#[derive(Parser)]
#[command(name = "stagewright")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable, checkpointed build pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Working root shared by all stages
    #[arg(long, global = true, env = "STAGEWRIGHT_ROOT", default_value = ".")]
    root: PathBuf,

    /// Pipeline file (default: <root>/stagewright.toml)
    #[arg(long, global = true, env = "STAGEWRIGHT_PIPELINE")]
    pipeline: Option<PathBuf>,

    /// Maximum concurrent stages within a parallel group
    #[arg(long, global = true, env = "STAGEWRIGHT_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Default per-stage timeout in seconds
    #[arg(long, global = true, env = "STAGEWRIGHT_STAGE_TIMEOUT")]
    stage_timeout: Option<u64>,

    /// Age in hours after which completion checkpoints are ignored
    #[arg(long, global = true, env = "STAGEWRIGHT_STALENESS_HOURS")]
    staleness_hours: Option<u64>,

    /// Ignore existing checkpoints and run every stage
    #[arg(long, global = true)]
    fresh: bool,

    /// Resume from checkpoints (set to false for the same effect as --fresh)
    #[arg(
        long,
        global = true,
        hide = true,
        env = "STAGEWRIGHT_RESUME",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    resume: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the pipeline, then run it
    Build {
        /// Build profile selecting which stages run
        #[arg(default_value = DEFAULT_PROFILE)]
        profile: String,
    },

    /// Run pre-flight validation only
    Validate {
        #[arg(default_value = DEFAULT_PROFILE)]
        profile: String,
    },

    /// Show checkpoint-derived progress, lock holder and last run
    Status {
        #[arg(long, default_value = DEFAULT_PROFILE)]
        profile: String,
    },

    /// Clear checkpoints, the progress marker and stage logs
    Clean {
        /// Also remove run reports
        #[arg(long)]
        all: bool,
    },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            max_parallel: self.max_parallel,
            stage_timeout_secs: self.stage_timeout,
            staleness_hours: self.staleness_hours,
            resume: if self.fresh { Some(false) } else { self.resume },
        }
    }

    fn pipeline_path(&self) -> PathBuf {
        self.pipeline
            .clone()
            .unwrap_or_else(|| self.root.join(PIPELINE_FILE))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let code = match &cli.command {
        Commands::Build { profile } => cmd_build(&cli, profile).await?,
        Commands::Validate { profile } => cmd_validate(&cli, profile)?,
        Commands::Status { profile } => cmd_status(&cli, profile)?,
        Commands::Clean { all } => cmd_clean(&cli, *all).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Load the pipeline file and resolve configuration.
fn load(cli: &Cli) -> Result<(EngineConfig, Pipeline)> {
    let path = cli.pipeline_path();
    let file = PipelineFile::load(&path)
        .with_context(|| format!("Failed to load pipeline {}", path.display()))?;
    let config = EngineConfig::from_section(&cli.root, &file.engine)
        .with_overrides(&cli.overrides())
        .context("Invalid configuration override")?;
    let pipeline = file
        .build(config.default_timeout)
        .context("Invalid pipeline definition")?;
    Ok((config, pipeline))
}

fn engine(cli: &Cli) -> Result<ExecutionEngine> {
    let (config, pipeline) = load(cli)?;
    let runner = ProcessStageRunner::new().with_heartbeat(config.heartbeat);
    ExecutionEngine::new(config, pipeline, Arc::new(runner)).context("Failed to open working root")
}

async fn cmd_build(cli: &Cli, profile: &str) -> Result<i32> {
    let mut engine = engine(cli)?;
    let cancel = spawn_interrupt_watcher();

    let summary = match engine.run(profile, cancel).await {
        Ok(summary) => summary,
        Err(e) if e.code() == stagewright_core::ErrorCode::Validation => {
            eprintln!("validation failed: {e}");
            return Ok(1);
        }
        Err(e) => return Err(e).context("Build aborted"),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary.report)?);
    } else {
        print!("{}", render_summary(&summary.report));
        println!("report: {}", summary.report_path.display());
    }
    Ok(summary.exit_code())
}

fn cmd_validate(cli: &Cli, profile: &str) -> Result<i32> {
    let mut engine = engine(cli)?;
    match engine.validate(profile) {
        Ok(()) => {
            let stages = engine.registry().for_profile(profile);
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "valid": true, "profile": profile, "stages": stages.stage_ids() })
                );
            } else {
                println!("pipeline valid: {} stage(s) for profile {profile}", stages.len());
            }
            Ok(0)
        }
        Err(e) => {
            if cli.json {
                println!("{}", serde_json::json!({ "valid": false, "profile": profile, "error": e.to_string() }));
            } else {
                eprintln!("{e}");
            }
            Ok(1)
        }
    }
}

fn cmd_status(cli: &Cli, profile: &str) -> Result<i32> {
    let (config, pipeline) = load(cli)?;
    let view = inspect(&config, &pipeline.registry, profile).context("Failed to read build state")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print!("{}", render_status(&view));
    }
    Ok(0)
}

async fn cmd_clean(cli: &Cli, all: bool) -> Result<i32> {
    // A missing pipeline file must not block cleanup.
    let path = cli.pipeline_path();
    let section = if Path::new(&path).exists() {
        PipelineFile::load(&path)
            .with_context(|| format!("Failed to load pipeline {}", path.display()))?
            .engine
    } else {
        Default::default()
    };
    let config = EngineConfig::from_section(&cli.root, &section).with_overrides(&cli.overrides())?;
    let owner = format!("clean-{}", std::process::id());

    let summary = clean(&config, &owner, all)
        .await
        .context("Failed to clean build bookkeeping")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "cleared checkpoints; removed {} log(s), {} report(s)",
            summary.logs_removed, summary.reports_removed
        );
    }
    Ok(0)
}

/// Flip the returned channel to `true` on Ctrl-C or SIGTERM.
fn spawn_interrupt_watcher() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; only Ctrl-C will interrupt");
                let _ = tokio::signal::ctrl_c().await;
                let _ = tx.send(true);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("Interrupt received; stopping the active stage");
        let _ = tx.send(true);
    });
    rx
}
