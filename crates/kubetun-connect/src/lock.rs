//! Process exclusivity lock
//!
//! One connect orchestration per workspace: the lock is a pid file claimed
//! with an atomic create. A file owned by a live process means another
//! instance is running; a stale file (dead owner) is removed and the claim
//! retried once. Two processes racing the create are resolved by whichever
//! wins the atomic create, the other fails fast.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Exclusivity lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process holds the lock
    #[error("another connect process is already running with {} (pid {pid})", path.display())]
    AlreadyRunning { path: PathBuf, pid: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A held pid-file lock.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Atomically claim `path` for this process.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match try_create(&path) {
            Ok(()) => Ok(Self { path }),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let owner = read_owner(&path);
                if let Some(pid) = owner {
                    if process_alive(pid) {
                        return Err(LockError::AlreadyRunning { path, pid });
                    }
                }
                debug!("Removing stale lock at {}", path.display());
                fs::remove_file(&path)?;
                match try_create(&path) {
                    Ok(()) => Ok(Self { path }),
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                        // Lost the re-claim race to another process
                        let pid = read_owner(&path).unwrap_or(0);
                        Err(LockError::AlreadyRunning { path, pid })
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file. An already-removed file is not an error.
    pub fn release(self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

fn try_create(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(file, "{}", std::process::id())
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without touching the process
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connect.pid");

        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_live_owner_blocks_acquisition() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connect.pid");
        // This test process is definitely alive
        fs::write(&path, std::process::id().to_string()).unwrap();

        match PidLock::acquire(&path) {
            Err(LockError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connect.pid");
        // Pid far beyond any real pid space
        fs::write(&path, "999999999").unwrap();

        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
        lock.release().unwrap();
    }

    #[test]
    fn test_released_lock_can_be_reacquired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connect.pid");

        PidLock::acquire(&path).unwrap().release().unwrap();
        let second = PidLock::acquire(&path).unwrap();
        second.release().unwrap();
    }

    #[test]
    fn test_unreadable_owner_is_treated_as_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connect.pid");
        fs::write(&path, "not-a-pid").unwrap();

        let lock = PidLock::acquire(&path).unwrap();
        lock.release().unwrap();
    }
}
