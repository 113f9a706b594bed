use super::os::is_process_running;
use crate::error::{LabError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Contents of the supervisor lockfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Control-plane endpoint of the holder
    pub socket: PathBuf,
}

/// Single-supervisor-per-host guard. Removed on drop.
#[derive(Debug)]
pub struct Lockfile {
    path: PathBuf,
    info: LockInfo,
}

impl Lockfile {
    /// Create the lockfile atomically, body included.
    ///
    /// The body is written to a private file first and hard-linked into
    /// place, so a lockfile is never observed empty. A lockfile naming a live
    /// process fails with `AlreadyRunning` unless `force` is set. One naming
    /// a dead process is replaced with a warning.
    pub fn acquire(path: &Path, socket: &Path, force: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
            socket: socket.to_path_buf(),
        };
        let body = serde_json::to_vec_pretty(&info)
            .map_err(|e| LabError::Internal(format!("lockfile encode: {e}")))?;

        let staged = staging_path(path, info.pid);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&staged)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        let linked = Self::link_into_place(&staged, path, force);
        if let Err(e) = std::fs::remove_file(&staged) {
            warn!(path = %staged.display(), "Failed to remove staged lockfile: {}", e);
        }
        linked?;

        info!(path = %path.display(), pid = info.pid, "Lockfile acquired");
        Ok(Self {
            path: path.to_path_buf(),
            info,
        })
    }

    fn link_into_place(staged: &Path, path: &Path, force: bool) -> Result<()> {
        // Two passes: the second runs after clearing a stale or forced lockfile.
        for _ in 0..2 {
            match std::fs::hard_link(staged, path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Self::clear_existing(path, force)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LabError::Internal(format!(
            "lockfile {} was recreated concurrently",
            path.display()
        )))
    }

    fn clear_existing(path: &Path, force: bool) -> Result<()> {
        match Self::read(path) {
            Some(holder) if holder.pid != std::process::id() && is_process_running(holder.pid) => {
                if !force {
                    return Err(LabError::AlreadyRunning {
                        pid: Some(holder.pid),
                    });
                }
                warn!(
                    pid = holder.pid,
                    "Overwriting lockfile held by a live process (--force)"
                );
            }
            Some(holder) => {
                warn!(pid = holder.pid, "Removing stale lockfile left by a dead supervisor");
            }
            None if !force && is_fresh(path) => {
                // Too young to call abandoned: its writer may still be filling it in.
                return Err(LabError::AlreadyRunning { pid: None });
            }
            None => {
                warn!(path = %path.display(), "Removing unreadable lockfile");
            }
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse the lockfile at `path`, if present and readable.
    pub fn read(path: &Path) -> Option<LockInfo> {
        let raw = std::fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Live holder of the lockfile at `path`.
    pub fn holder(path: &Path) -> Option<LockInfo> {
        Self::read(path).filter(|info| is_process_running(info.pid))
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lockfile if it still names this process.
    pub fn release(&self) {
        if Self::read(&self.path).is_some_and(|held| held.pid == self.info.pid) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "Failed to remove lockfile: {}", e);
            } else {
                info!(path = %self.path.display(), "Lockfile released");
            }
        }
    }
}

/// How long an unreadable lockfile is presumed to belong to a starting holder.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

fn staging_path(path: &Path, pid: u32) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{pid}.tmp"));
    path.with_file_name(name)
}

fn is_fresh(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age < UNREADABLE_GRACE)
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn write_holder(path: &Path, pid: u32) {
        let info = LockInfo {
            pid,
            started_at: Utc::now(),
            socket: PathBuf::from("/tmp/other.sock"),
        };
        std::fs::write(path, serde_json::to_vec(&info).unwrap()).unwrap();
    }

    #[test]
    fn acquire_writes_pid_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("supervisor.lock");
        {
            let lock = Lockfile::acquire(&path, Path::new("/tmp/s.sock"), false).unwrap();
            let held = Lockfile::read(&path).unwrap();
            assert_eq!(held.pid, std::process::id());
            assert_eq!(lock.info(), &held);
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_holder_blocks_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.lock");
        let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        write_holder(&path, other.id());

        let err = Lockfile::acquire(&path, Path::new("/tmp/s.sock"), false).unwrap_err();
        assert!(matches!(err, LabError::AlreadyRunning { pid } if pid == Some(other.id())));
        // the holder's lockfile is untouched
        assert_eq!(Lockfile::read(&path).unwrap().pid, other.id());

        let lock = Lockfile::acquire(&path, Path::new("/tmp/s.sock"), true).unwrap();
        assert_eq!(Lockfile::read(&path).unwrap().pid, std::process::id());
        drop(lock);

        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[test]
    fn stale_lockfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.lock");
        let mut dead = std::process::Command::new("true").spawn().unwrap();
        let pid = dead.id();
        dead.wait().unwrap();
        write_holder(&path, pid);

        let _lock = Lockfile::acquire(&path, Path::new("/tmp/s.sock"), false).unwrap();
        assert_eq!(Lockfile::read(&path).unwrap().pid, std::process::id());
        assert!(Lockfile::holder(&path).is_some());
    }

    #[test]
    fn old_garbage_lockfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.lock");
        std::fs::write(&path, "not json").unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        drop(file);

        let _lock = Lockfile::acquire(&path, Path::new("/tmp/s.sock"), false).unwrap();
        assert!(Lockfile::read(&path).is_some());
    }

    #[test]
    fn freshly_created_empty_lockfile_counts_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.lock");
        let _other = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();

        let err = Lockfile::acquire(&path, Path::new("/tmp/s.sock"), false).unwrap_err();
        assert!(matches!(err, LabError::AlreadyRunning { pid: None }));
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap().len(), 0);
        // no staging debris left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let _lock = Lockfile::acquire(&path, Path::new("/tmp/s.sock"), true).unwrap();
        assert_eq!(Lockfile::read(&path).unwrap().pid, std::process::id());
    }

    #[test]
    fn acquired_lockfile_is_never_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.lock");
        let first = Lockfile::acquire(&path, Path::new("/tmp/s.sock"), false).unwrap();
        let body = std::fs::read(&path).unwrap();
        assert!(!body.is_empty());
        drop(first);
        assert!(!path.exists());
    }
}
