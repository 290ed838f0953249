//! Log output for the stagewright binary.
//!
//! Everything goes to stderr: stdout carries command results (`status`,
//! `--json` reports) and must stay parseable. Stage process output never
//! reaches this subscriber; it is captured in `.stagewright/logs/<stage>.log`.
//!
//! Filtering, in order of precedence:
//!
//! 1. `STAGEWRIGHT_LOG`, an `EnvFilter` directive string
//! 2. `RUST_LOG`
//! 3. the CLI verbosity for stagewright's own targets, `warn` for dependencies

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read before `RUST_LOG`.
const LOG_ENV: &str = "STAGEWRIGHT_LOG";

/// Install the global subscriber. Only the first call in a process has any
/// effect.
///
/// With `json` each event is one JSON object per line and carries the
/// fields of the enclosing `stagewright.run` span.
pub fn init_tracing(json: bool, level: Level) {
    let filter = env_filter(level);
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().with_current_span(true))
            .try_init()
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

// Covers both `stagewright` (the binary) and `stagewright_core` by prefix.
fn default_directives(level: Level) -> String {
    format!("warn,stagewright={}", level.as_str().to_ascii_lowercase())
}
