//! Named exclusive locks backed by marker files.
//!
//! A lock is a file `<dir>/<resource>.lock` created with exclusive-create
//! semantics and holding the owner's identity. Acquisition is scoped: the
//! returned [`LockGuard`] releases the marker when dropped, on every exit path.
//!
//! Age alone never frees a lock: an old marker is broken only once its
//! owner's pid is gone.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Resource name guarding the shared build root.
pub const BUILD_ROOT_LOCK: &str = "build-root";

/// Age after which a lock whose owner process is gone may be broken.
pub const DEFAULT_LOCK_STALENESS: Duration = Duration::from_secs(600);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Contents of a lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub resource_name: String,
    pub owner_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Creates and releases lock markers on behalf of one owner.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    owner_id: String,
    staleness: Duration,
}

impl LockManager {
    pub fn new(dir: impl AsRef<Path>, owner_id: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            owner_id: owner_id.into(),
            staleness: DEFAULT_LOCK_STALENESS,
        })
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    fn marker_path(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{resource}.lock"))
    }

    /// Acquire `resource`, polling until `timeout` elapses.
    ///
    /// On timeout the holder is broken only when it is both older than the
    /// staleness threshold and no longer alive. A holder whose process still
    /// runs keeps the lock however old it is.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockGuard> {
        let path = self.marker_path(resource);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(guard) = self.try_create(resource, &path)? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let holder = read_marker(&path);
        let age = marker_age(&path, holder.as_ref());
        let expired = age.is_some_and(|age| age > self.staleness);
        if expired && !self.holder_alive(holder.as_ref()) {
            warn!(
                resource = %resource,
                holder = %holder.as_ref().map_or("unknown", |h| h.owner_id.as_str()),
                age_secs = age.map_or(0, |a| a.as_secs()),
                "Breaking stale lock"
            );
            if self.break_marker(&path, holder.as_ref())? {
                if let Some(mut guard) = self.try_create(resource, &path)? {
                    guard.broken = holder;
                    return Ok(guard);
                }
            }
        } else if expired {
            debug!(resource = %resource, "Lock holder is old but still running; not breaking");
        }

        let holder = read_marker(&path)
            .map(|h| h.owner_id)
            .unwrap_or_else(|| "unknown".to_string());
        Err(OrchestratorError::LockAcquisition {
            resource: resource.to_string(),
            holder,
            waited: timeout,
        })
    }

    // An unreadable marker has no pid to probe; its age alone decides.
    fn holder_alive(&self, holder: Option<&LockInfo>) -> bool {
        let Some(holder) = holder else {
            return false;
        };
        if holder.pid == std::process::id() {
            // Another owner inside this process; it cannot have died without us.
            return holder.owner_id != self.owner_id;
        }
        process_alive(holder.pid)
    }

    /// Remove the marker judged stale, but only if it is still that marker.
    ///
    /// The marker is first renamed to a private tombstone so that a fresh
    /// marker created by another waiter is never deleted by mistake. When the
    /// tombstone turns out to hold someone else's marker it is put back.
    fn break_marker(&self, path: &Path, judged: Option<&LockInfo>) -> Result<bool> {
        let tombstone = self.dir.join(format!(
            "{}.{}.broken",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("lock"),
            Uuid::new_v4().simple()
        ));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let taken = read_marker(&tombstone);
        if taken.as_ref() != judged {
            warn!(
                holder = %taken.as_ref().map_or("unknown", |h| h.owner_id.as_str()),
                "Lock changed hands while breaking it; restoring"
            );
            // hard_link refuses to overwrite a marker created in the meantime.
            if let Err(e) = fs::hard_link(&tombstone, path) {
                warn!(error = %e, "Could not restore lock marker");
            }
            let _ = fs::remove_file(&tombstone);
            return Ok(false);
        }

        fs::remove_file(&tombstone)?;
        Ok(true)
    }

    fn try_create(&self, resource: &str, path: &Path) -> Result<Option<LockGuard>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let info = LockInfo {
                    resource_name: resource.to_string(),
                    owner_id: self.owner_id.clone(),
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                };
                file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                file.sync_all()?;
                debug!(resource = %resource, owner = %self.owner_id, "Lock acquired");
                Ok(Some(LockGuard {
                    path: path.to_path_buf(),
                    resource: resource.to_string(),
                    owner_id: self.owner_id.clone(),
                    broken: None,
                    released: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Release `resource` if this owner holds it.
    ///
    /// Returns `false` (and logs a warning) when the lock is absent or held by
    /// someone else; double release is never an error.
    pub fn release(&self, resource: &str) -> bool {
        release_marker(&self.marker_path(resource), resource, &self.owner_id)
    }

    /// Current holder of `resource`, if the marker exists and is readable.
    pub fn holder(&self, resource: &str) -> Option<LockInfo> {
        read_marker(&self.marker_path(resource))
    }
}

/// Scoped lock ownership. The marker is removed when the guard is dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    resource: String,
    owner_id: String,
    broken: Option<LockInfo>,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The stale holder that was force-broken to obtain this lock, if any.
    pub fn broke_stale_holder(&self) -> Option<&LockInfo> {
        self.broken.as_ref()
    }

    pub fn release(mut self) {
        release_marker(&self.path, &self.resource, &self.owner_id);
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            release_marker(&self.path, &self.resource, &self.owner_id);
        }
    }
}

fn read_marker(path: &Path) -> Option<LockInfo> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

// Falls back to the file's mtime when the marker is unreadable (e.g. mid-write).
fn marker_age(path: &Path, info: Option<&LockInfo>) -> Option<Duration> {
    if let Some(info) = info {
        return (Utc::now() - info.acquired_at).to_std().ok();
    }
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

// Signal 0 probes for existence; EPERM still means the process exists.
fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn release_marker(path: &Path, resource: &str, owner_id: &str) -> bool {
    match read_marker(path) {
        Some(info) if info.owner_id == owner_id => match fs::remove_file(path) {
            Ok(()) => {
                debug!(resource = %resource, owner = %owner_id, "Lock released");
                true
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Failed to remove lock marker");
                false
            }
        },
        Some(info) => {
            warn!(
                resource = %resource,
                owner = %owner_id,
                holder = %info.owner_id,
                "Ignoring release of lock held by another owner"
            );
            false
        }
        None => {
            warn!(resource = %resource, owner = %owner_id, "Ignoring release of lock that is not held");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), "owner-a").unwrap();
        {
            let guard = locks.acquire(BUILD_ROOT_LOCK, Duration::from_millis(200)).await.unwrap();
            assert_eq!(guard.resource(), BUILD_ROOT_LOCK);
            assert_eq!(locks.holder(BUILD_ROOT_LOCK).unwrap().owner_id, "owner-a");
        }
        assert!(locks.holder(BUILD_ROOT_LOCK).is_none());
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let a = LockManager::new(dir.path(), "owner-a").unwrap();
        let b = LockManager::new(dir.path(), "owner-b").unwrap();

        let _held = a.acquire(BUILD_ROOT_LOCK, Duration::from_millis(100)).await.unwrap();
        let err = b.acquire(BUILD_ROOT_LOCK, Duration::from_millis(300)).await.unwrap_err();
        match err {
            OrchestratorError::LockAcquisition { holder, .. } => assert_eq!(holder, "owner-a"),
            other => panic!("expected LockAcquisition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let stale = LockInfo {
            resource_name: BUILD_ROOT_LOCK.to_string(),
            owner_id: "dead-owner".to_string(),
            pid: exited_pid(),
            acquired_at: Utc::now() - chrono::Duration::minutes(11),
        };
        fs::write(
            dir.path().join("build-root.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let locks = LockManager::new(dir.path(), "owner-b").unwrap();
        let guard = locks.acquire(BUILD_ROOT_LOCK, Duration::from_millis(150)).await.unwrap();
        assert_eq!(guard.broke_stale_holder().unwrap().owner_id, "dead-owner");
        assert_eq!(locks.holder(BUILD_ROOT_LOCK).unwrap().owner_id, "owner-b");
    }

    fn exited_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn write_marker(dir: &Path, owner: &str, pid: u32, age: chrono::Duration) -> LockInfo {
        let info = LockInfo {
            resource_name: BUILD_ROOT_LOCK.to_string(),
            owner_id: owner.to_string(),
            pid,
            acquired_at: Utc::now() - age,
        };
        fs::write(dir.join("build-root.lock"), serde_json::to_string(&info).unwrap()).unwrap();
        info
    }

    #[tokio::test]
    async fn test_old_lock_with_live_owner_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        // Our own pid under another owner id stands in for a long-running build.
        write_marker(dir.path(), "long-build", std::process::id(), chrono::Duration::hours(2));

        let locks = LockManager::new(dir.path(), "owner-b")
            .unwrap()
            .with_staleness(Duration::from_secs(60));
        let err = locks.acquire(BUILD_ROOT_LOCK, Duration::from_millis(150)).await.unwrap_err();
        match err {
            OrchestratorError::LockAcquisition { holder, .. } => assert_eq!(holder, "long-build"),
            other => panic!("expected LockAcquisition, got {other:?}"),
        }
        assert_eq!(locks.holder(BUILD_ROOT_LOCK).unwrap().owner_id, "long-build");
    }

    #[test]
    fn test_break_restores_marker_replaced_by_new_holder() {
        let dir = tempfile::tempdir().unwrap();
        let judged = write_marker(dir.path(), "dead-owner", 999_999, chrono::Duration::hours(2));
        // A waiter broke and re-acquired the lock after we judged it stale.
        write_marker(dir.path(), "fresh-owner", 999_998, chrono::Duration::zero());

        let locks = LockManager::new(dir.path(), "owner-b").unwrap();
        let path = locks.marker_path(BUILD_ROOT_LOCK);
        assert!(!locks.break_marker(&path, Some(&judged)).unwrap());
        assert_eq!(locks.holder(BUILD_ROOT_LOCK).unwrap().owner_id, "fresh-owner");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".broken"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_break_removes_marker_still_held_by_stale_owner() {
        let dir = tempfile::tempdir().unwrap();
        let judged = write_marker(dir.path(), "dead-owner", 999_999, chrono::Duration::hours(2));

        let locks = LockManager::new(dir.path(), "owner-b").unwrap();
        let path = locks.marker_path(BUILD_ROOT_LOCK);
        assert!(locks.break_marker(&path, Some(&judged)).unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let a = LockManager::new(dir.path(), "owner-a").unwrap();
        let b = LockManager::new(dir.path(), "owner-b").unwrap();

        let guard = a.acquire(BUILD_ROOT_LOCK, Duration::from_millis(100)).await.unwrap();
        assert!(!b.release(BUILD_ROOT_LOCK));
        assert_eq!(a.holder(BUILD_ROOT_LOCK).unwrap().owner_id, "owner-a");

        guard.release();
        assert!(!a.release(BUILD_ROOT_LOCK));
    }
}
