//! Append-only checkpoint log.
//!
//! One record per line: `timestamp:stageId:status:digest:payload`.
//! `timestamp` is Unix seconds, `payload` is compact versioned JSON and
//! `digest` is the first 16 hex chars of SHA-256 over
//! `timestamp:stageId:status:payload`. Any line failing to parse, verify or
//! match the payload schema is reported as corrupted and skipped; the valid
//! records around it are still returned.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::registry::is_valid_stage_id;

/// Current payload schema version.
pub const PAYLOAD_VERSION: u32 = 1;

const DIGEST_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Started,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Started => "started",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(CheckpointStatus::Started),
            "completed" => Some(CheckpointStatus::Completed),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

/// Versioned payload carried by every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// Schema version; must equal [`PAYLOAD_VERSION`].
    pub v: u32,
    pub run_id: Uuid,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Set when completion was granted by a recovery strategy after a failed attempt.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CheckpointPayload {
    pub fn new(run_id: Uuid, attempt: u32) -> Self {
        Self {
            v: PAYLOAD_VERSION,
            run_id,
            attempt,
            profile: None,
            error_code: None,
            exit_code: None,
            duration_ms: None,
            recovered: false,
            note: None,
        }
    }
}

/// One immutable stage transition record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: CheckpointStatus,
    pub payload: CheckpointPayload,
}

impl Checkpoint {
    /// New record stamped with the current time (second precision, as persisted).
    pub fn new(stage_id: impl Into<String>, status: CheckpointStatus, payload: CheckpointPayload) -> Self {
        Self::at(stage_id, Utc::now(), status, payload)
    }

    pub fn at(
        stage_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        status: CheckpointStatus,
        payload: CheckpointPayload,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            timestamp: timestamp.trunc_subsecs(0),
            status,
            payload,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.timestamp
    }

    /// Serialize to one log line (without the trailing newline).
    pub fn encode(&self) -> Result<String> {
        let payload = serde_json::to_string(&self.payload)?;
        let ts = self.timestamp.timestamp();
        let digest = record_digest(ts, &self.stage_id, self.status.as_str(), &payload);
        Ok(format!(
            "{ts}:{}:{}:{digest}:{payload}",
            self.stage_id,
            self.status.as_str()
        ))
    }

    /// Parse one log line. The error string describes why the record is corrupted.
    pub fn decode(line: &str) -> std::result::Result<Self, String> {
        let mut fields = line.splitn(5, ':');
        let (Some(ts), Some(stage_id), Some(status), Some(digest), Some(payload)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err("truncated record".to_string());
        };

        let secs: i64 = ts.parse().map_err(|_| format!("bad timestamp {ts:?}"))?;
        let timestamp =
            DateTime::from_timestamp(secs, 0).ok_or_else(|| format!("timestamp out of range: {secs}"))?;
        if !is_valid_stage_id(stage_id) {
            return Err(format!("bad stage id {stage_id:?}"));
        }
        let status = CheckpointStatus::parse(status).ok_or_else(|| format!("bad status {status:?}"))?;

        let expected = record_digest(secs, stage_id, status.as_str(), payload);
        if digest != expected {
            return Err(format!("digest mismatch (expected {expected}, found {digest})"));
        }

        let payload: CheckpointPayload =
            serde_json::from_str(payload).map_err(|e| format!("payload schema: {e}"))?;

        Ok(Self {
            stage_id: stage_id.to_string(),
            timestamp,
            status,
            payload,
        })
    }
}

fn record_digest(ts: i64, stage_id: &str, status: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{ts}:{stage_id}:{status}:{payload}").as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(DIGEST_LEN);
    hex
}

/// Result of checking a decoded record against schema and staleness rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointValidity {
    Valid,
    /// Older than the staleness window; treated as absent.
    Stale { age: ChronoDuration },
    /// Structurally unusable; treated as absent.
    Corrupted(String),
}

impl CheckpointValidity {
    pub fn is_valid(&self) -> bool {
        matches!(self, CheckpointValidity::Valid)
    }
}

/// Reject records with an unsupported payload version or older than `staleness`.
pub fn validate_checkpoint(
    record: &Checkpoint,
    now: DateTime<Utc>,
    staleness: ChronoDuration,
) -> CheckpointValidity {
    if record.payload.v != PAYLOAD_VERSION {
        return CheckpointValidity::Corrupted(format!(
            "unsupported payload version {}",
            record.payload.v
        ));
    }
    if !is_valid_stage_id(&record.stage_id) {
        return CheckpointValidity::Corrupted(format!("bad stage id {:?}", record.stage_id));
    }
    let age = record.age(now);
    if age > staleness {
        return CheckpointValidity::Stale { age };
    }
    CheckpointValidity::Valid
}

/// For each stage, the completion record that currently stands.
///
/// The latest `completed` record is authoritative unless a later `started`
/// record for the same stage shows that a re-execution began after it.
pub fn authoritative_completions(records: &[Checkpoint]) -> HashMap<&str, &Checkpoint> {
    let mut done: HashMap<&str, &Checkpoint> = HashMap::new();
    for record in records {
        match record.status {
            CheckpointStatus::Completed => {
                done.insert(record.stage_id.as_str(), record);
            }
            CheckpointStatus::Started => {
                done.remove(record.stage_id.as_str());
            }
            CheckpointStatus::Failed => {}
        }
    }
    done
}

/// A line that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    /// 1-based line number.
    pub line: usize,
    pub reason: String,
}

impl From<CorruptRecord> for OrchestratorError {
    fn from(record: CorruptRecord) -> Self {
        OrchestratorError::CheckpointCorruption {
            line: record.line,
            reason: record.reason,
        }
    }
}

/// Records read back from the log, in append order.
#[derive(Debug, Clone, Default)]
pub struct LoadedLog {
    pub records: Vec<Checkpoint>,
    pub corrupted: Vec<CorruptRecord>,
}

/// File-backed append-only checkpoint store.
///
/// Appends within one process serialize on an internal mutex; across
/// processes they serialize through the build-root lock.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    append_guard: Mutex<()>,
}

impl CheckpointStore {
    /// Open (creating the parent directory if needed) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            append_guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record.
    ///
    /// The record is written with a single `write_all` and flushed with
    /// `sync_data`. A torn trailing line left by an earlier crash is closed off
    /// with a newline first so it cannot merge with the new record.
    pub fn append(&self, record: &Checkpoint) -> Result<()> {
        let mut line = record.encode()?;
        line.push('\n');

        let _guard = self
            .append_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if needs_separator(&self.path)? {
            line.insert(0, '\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Read every line, separating usable records from corrupted ones.
    pub fn load(&self) -> Result<LoadedLog> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadedLog::default()),
            Err(e) => return Err(e.into()),
        };

        let mut log = LoadedLog::default();
        for (idx, line) in BufReader::new(file).split(b'\n').enumerate() {
            let raw = line?;
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let line_no = idx + 1;
            let decoded = std::str::from_utf8(&raw)
                .map_err(|_| "record is not valid UTF-8".to_string())
                .and_then(|text| Checkpoint::decode(text.trim_end_matches('\r')));
            match decoded {
                Ok(record) => log.records.push(record),
                Err(reason) => {
                    let record = CorruptRecord {
                        line: line_no,
                        reason,
                    };
                    warn!(
                        error = %OrchestratorError::from(record.clone()),
                        path = %self.path.display(),
                        "Discarding corrupted checkpoint record"
                    );
                    log.corrupted.push(record);
                }
            }
        }
        Ok(log)
    }

    /// The standing, non-stale completion record for `stage_id`, if any.
    pub fn latest_completed(
        &self,
        stage_id: &str,
        now: DateTime<Utc>,
        staleness: ChronoDuration,
    ) -> Result<Option<Checkpoint>> {
        let log = self.load()?;
        let completions = authoritative_completions(&log.records);
        Ok(completions
            .get(stage_id)
            .filter(|record| validate_checkpoint(record, now, staleness).is_valid())
            .map(|record| (*record).clone()))
    }

    /// Remove every record. Only called outside the run loop.
    pub fn clear(&self) -> Result<()> {
        let _guard = self
            .append_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn needs_separator(path: &Path) -> Result<bool> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
