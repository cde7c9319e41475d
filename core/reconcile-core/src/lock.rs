//! Sidecar lock directories guarding state record writes.
//!
//! Every writer of `state/{worker_id}.json` (the reconciler and the workers
//! themselves) takes the lock at `state/{worker_id}.json.lock/` first. Creating
//! a directory is atomic, so exactly one writer wins.
//!
//! ```text
//! {worker_id}.json.lock/
//! ├── pid          # Plain text: the holder's process ID
//! └── meta.json    # { pid, proc_started, created }
//! ```
//!
//! # Stale Locks
//!
//! A holder that crashes leaves its directory behind. A lock whose PID is dead,
//! or whose PID was recycled (start time differs from `proc_started`), is
//! renamed to a unique tombstone, checked to still be the lock that was
//! judged, deleted, and retried. A process that exists but belongs to another
//! user counts as alive. A lock whose metadata cannot be read is only taken over
//! once it is older than 30 seconds, because the holder may still be writing it.
//!
//! Locking is advisory: a writer that bypasses [`LockGuard`] is not stopped.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ReconcileError, Result};

/// How long a lock without readable metadata is respected before takeover.
const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockMeta {
    pid: u32,
    #[serde(default)]
    proc_started: Option<u64>,
    created: u64,
}

/// Lock token path for a record: `foo.json` → `foo.json.lock`.
pub fn lock_path_for(record_path: &Path) -> PathBuf {
    let mut name = record_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    record_path.with_file_name(name)
}

pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill(pid, 0) sends no signal; it only checks existence.
        let rc = unsafe { libc::kill(pid as i32, 0) };
        // EPERM: the process exists but belongs to another user.
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Held lock on one record. The directory is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    dir: PathBuf,
}

impl LockGuard {
    /// Acquires the sidecar lock for `record_path`, polling every `poll` until
    /// `timeout` has elapsed.
    pub fn acquire(record_path: &Path, timeout: Duration, poll: Duration) -> Result<Self> {
        let dir = lock_path_for(record_path);
        let started = Instant::now();

        loop {
            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    if let Err(err) = write_meta(&dir) {
                        let _ = fs::remove_dir_all(&dir);
                        return Err(err);
                    }
                    debug!(lock = %dir.display(), "Acquired record lock");
                    return Ok(LockGuard { dir });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let LockState::Stale(judged) = inspect(&dir) {
                        warn!(lock = %dir.display(), "Removing stale record lock");
                        if take_over(&dir, &judged) {
                            continue;
                        }
                    }
                }
                Err(err) => {
                    return Err(ReconcileError::io(
                        format!("Failed to create lock {}", dir.display()),
                        err,
                    ));
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ReconcileError::LockTimeout { path: dir, waited });
            }
            thread::sleep(poll.min(timeout.saturating_sub(waited)));
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            warn!(lock = %self.dir.display(), error = %err, "Failed to release record lock");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn write_meta(dir: &Path) -> Result<()> {
    let pid = std::process::id();
    let meta = LockMeta {
        pid,
        proc_started: crate::process::process_start_time(pid),
        created: now_ms(),
    };
    fs::write(dir.join("pid"), pid.to_string())
        .map_err(|err| ReconcileError::io("Failed to write lock pid", err))?;
    let content = serde_json::to_string_pretty(&meta)
        .map_err(|err| ReconcileError::json("Failed to serialize lock metadata", err))?;
    fs::write(dir.join("meta.json"), content)
        .map_err(|err| ReconcileError::io("Failed to write lock metadata", err))
}

fn read_meta(dir: &Path) -> Option<LockMeta> {
    let content = std::fs::read_to_string(dir.join("meta.json")).ok()?;
    serde_json::from_str(&content).ok()
}

fn dir_age(dir: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(dir).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

enum LockState {
    Held,
    /// Stale, with the metadata it was judged on.
    Stale(Option<LockMeta>),
}

fn inspect(dir: &Path) -> LockState {
    let Some(meta) = read_meta(dir) else {
        // Holder may be between create_dir and write_meta.
        return match dir_age(dir) {
            Some(age) if age > UNREADABLE_LOCK_GRACE => LockState::Stale(None),
            _ => LockState::Held,
        };
    };

    if !is_pid_alive(meta.pid) {
        return LockState::Stale(Some(meta));
    }

    match (meta.proc_started, crate::process::process_start_time(meta.pid)) {
        // ±2s tolerance between the holder's own reading and ours.
        (Some(expected), Some(actual)) if actual.abs_diff(expected) > 2 => {
            LockState::Stale(Some(meta))
        }
        _ => LockState::Held,
    }
}

fn tombstone_path(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".stale-{}-{}", std::process::id(), now_nanos()));
    dir.with_file_name(name)
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Moves the lock judged stale out of the way with one rename, then deletes
/// it. If `dir` turned out to hold a different lock by the time of the rename
/// (another contender took over first), the lock is put back and false is
/// returned.
fn take_over(dir: &Path, judged: &Option<LockMeta>) -> bool {
    let tombstone = tombstone_path(dir);
    if std::fs::rename(dir, &tombstone).is_err() {
        return false;
    }

    if read_meta(&tombstone) != *judged {
        if let Err(err) = std::fs::rename(&tombstone, dir) {
            warn!(lock = %dir.display(), error = %err, "Failed to restore record lock");
        }
        return false;
    }

    if let Err(err) = fs::remove_dir_all(&tombstone) {
        warn!(lock = %tombstone.display(), error = %err, "Failed to delete stale lock");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const POLL: Duration = Duration::from_millis(10);

    fn plant_lock(record: &Path, pid: u32, proc_started: Option<u64>) -> PathBuf {
        let dir = lock_path_for(record);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("pid"), pid.to_string()).unwrap();
        let meta = LockMeta {
            pid,
            proc_started,
            created: now_ms(),
        };
        fs::write(dir.join("meta.json"), serde_json::to_string(&meta).unwrap()).unwrap();
        dir
    }

    #[test]
    fn lock_path_is_sidecar_of_record() {
        assert_eq!(
            lock_path_for(Path::new("/ws/state/mm_1h.json")),
            PathBuf::from("/ws/state/mm_1h.json.lock")
        );
    }

    #[test]
    fn acquire_and_release_on_drop() {
        let temp = tempdir().unwrap();
        let record = temp.path().join("mm_1h.json");
        let lock_dir = lock_path_for(&record);

        {
            let guard = LockGuard::acquire(&record, Duration::from_secs(1), POLL).unwrap();
            assert!(guard.path().is_dir());
            assert!(lock_dir.join("meta.json").is_file());
        }
        assert!(!lock_dir.exists());
    }

    #[test]
    fn times_out_when_held_by_live_process() {
        let temp = tempdir().unwrap();
        let record = temp.path().join("mm_1h.json");
        let own_start = crate::process::process_start_time(std::process::id());
        plant_lock(&record, std::process::id(), own_start);

        let err = LockGuard::acquire(&record, Duration::from_millis(100), POLL).unwrap_err();
        assert!(matches!(err, ReconcileError::LockTimeout { .. }));
        // The foreign lock is left in place.
        assert!(lock_path_for(&record).is_dir());
    }

    #[test]
    fn takes_over_lock_of_dead_process() {
        let temp = tempdir().unwrap();
        let record = temp.path().join("mm_1h.json");
        plant_lock(&record, 99_999_999, Some(1_704_067_200));

        let guard = LockGuard::acquire(&record, Duration::from_secs(1), POLL).unwrap();
        let meta = read_meta(guard.path()).expect("fresh metadata");
        assert_eq!(meta.pid, std::process::id());
    }

    #[test]
    fn takes_over_lock_with_recycled_pid() {
        let temp = tempdir().unwrap();
        let record = temp.path().join("mm_1h.json");
        // Our own PID, but a start time that cannot be ours.
        plant_lock(&record, std::process::id(), Some(1));

        assert!(LockGuard::acquire(&record, Duration::from_secs(1), POLL).is_ok());
    }

    #[test]
    fn pid_owned_by_another_user_counts_as_alive() {
        // init always exists; unprivileged callers get EPERM for it.
        assert!(is_pid_alive(1));
        assert!(!is_pid_alive(99_999_999));
    }

    #[test]
    fn takeover_leaves_a_replaced_lock_alone() {
        let temp = tempdir().unwrap();
        let record = temp.path().join("mm_1h.json");
        let dir = plant_lock(&record, 99_999_999, Some(1_704_067_200));
        let judged = read_meta(&dir);
        assert!(matches!(inspect(&dir), LockState::Stale(_)));

        // Another contender removes the stale lock and takes its own first.
        fs::remove_dir_all(&dir).unwrap();
        plant_lock(&record, std::process::id(), Some(1));

        assert!(!take_over(&dir, &judged));
        let meta = read_meta(&dir).expect("replacement lock intact");
        assert_eq!(meta.pid, std::process::id());
        let leftovers = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn takeover_removes_the_judged_lock() {
        let temp = tempdir().unwrap();
        let record = temp.path().join("mm_1h.json");
        let dir = plant_lock(&record, 99_999_999, Some(1_704_067_200));
        let judged = read_meta(&dir);

        assert!(take_over(&dir, &judged));
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn fresh_lock_without_metadata_is_respected() {
        let temp = tempdir().unwrap();
        let record = temp.path().join("mm_1h.json");
        fs::create_dir_all(lock_path_for(&record)).unwrap();

        let result = LockGuard::acquire(&record, Duration::from_millis(50), POLL);
        assert!(matches!(result, Err(ReconcileError::LockTimeout { .. })));
    }
}
