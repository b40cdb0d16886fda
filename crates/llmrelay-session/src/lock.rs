//! Sidecar PID lock files (§4.H, §6): `<sessionFile>.lock` holding
//! `{"pid": <int>}`. Cross-process safety, not an in-process mutex — the
//! point is to make an orphaned session file observable after a crash.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockContents {
    pid: u32,
}

/// Held for the lifetime of a recording session; deletes its sidecar file
/// on drop (best-effort — a process that's killed outright leaves the
/// lock behind, which [`crate::cleanup::cleanup_stale_locks`] sweeps up).
pub struct SessionLock {
    path: PathBuf,
}

pub fn lock_path_for(session_file: &Path) -> PathBuf {
    let mut path = session_file.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

impl SessionLock {
    /// Write `{pid}` for the current process to `<session_file>.lock`.
    pub async fn acquire(session_file: &Path) -> Result<Self> {
        let path = lock_path_for(session_file);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = LockContents { pid: std::process::id() };
        tokio::fs::write(&path, serde_json::to_vec(&contents)?).await?;
        Ok(Self { path })
    }

    pub async fn release(self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read a lock file's PID. `None` covers both "file absent" and "unreadable
/// or non-integer content" — both are treated identically by callers (§6:
/// "unreadable or non-integer PID is treated as dead").
pub async fn read_lock_pid(lock_path: &Path) -> Option<u32> {
    let bytes = tokio::fs::read(lock_path).await.ok()?;
    serde_json::from_slice::<LockContents>(&bytes)
        .ok()
        .map(|c| c.pid)
}

/// Signal-0 liveness probe (§4.H: "send signal 0 to PID; any raised error
/// means not-alive"). Non-Unix targets have no equivalent syscall exposed
/// here, so a PID is conservatively reported alive — cleanup must never
/// delete a live session's data on a platform where liveness can't be
/// checked.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    // SAFETY: `kill` with signal 0 performs no action beyond existence/
    // permission checks; it never sends a real signal.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn acquire_writes_current_pid_and_release_removes_it() {
        let dir = tempdir().unwrap();
        let session_file = dir.path().join("session-abc.jsonl");

        let lock = SessionLock::acquire(&session_file).await.unwrap();
        let lock_path = lock_path_for(&session_file);
        assert!(lock_path.exists());

        let pid = read_lock_pid(&lock_path).await.unwrap();
        assert_eq!(pid, std::process::id());

        lock.release().await.unwrap();
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn missing_lock_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("session-missing.jsonl.lock");
        assert!(read_lock_pid(&lock_path).await.is_none());
    }

    #[tokio::test]
    async fn unreadable_json_reads_as_none() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("session-bad.jsonl.lock");
        tokio::fs::write(&lock_path, b"not json").await.unwrap();
        assert!(read_lock_pid(&lock_path).await.is_none());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn pid_1_is_assumed_not_special_cased() {
        // Just exercises the syscall path on an arbitrary valid pid;
        // doesn't assert a specific liveness result since pid 1 may or
        // may not be visible depending on the sandbox.
        let _ = is_pid_alive(1);
    }
}
