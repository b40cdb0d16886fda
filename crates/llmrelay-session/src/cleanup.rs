//! Stale-lock sweep and retention decisions (§4.H).

use std::path::Path;

use crate::lock::{is_pid_alive, lock_path_for, read_lock_pid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    /// No lock exists at all: the data file is safe to delete outright.
    Delete,
    /// A lock exists and its owning process is alive: leave everything.
    Skip,
    /// The lock is stale (missing/unreadable/dead PID): the lock itself is
    /// removed, but the data file is left for the retention policy.
    StaleLockOnly,
}

/// Decide — and, for the `StaleLockOnly` case, immediately act on — what to
/// do with one session's data file.
pub async fn should_delete_session(data_file: &Path) -> std::io::Result<CleanupAction> {
    let lock_path = lock_path_for(data_file);
    if !lock_path.exists() {
        return Ok(CleanupAction::Delete);
    }

    match read_lock_pid(&lock_path).await {
        Some(pid) if is_pid_alive(pid) => Ok(CleanupAction::Skip),
        _ => {
            match tokio::fs::remove_file(&lock_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            Ok(CleanupAction::StaleLockOnly)
        }
    }
}

/// Remove every lock file in `chats_dir` whose data file is gone
/// (orphaned) or whose owning PID is dead (stale). Live locks are left
/// untouched.
pub async fn cleanup_stale_locks(chats_dir: &Path) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(chats_dir).await?;
    let mut removed = 0usize;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".lock") {
            continue;
        }

        let data_file = chats_dir.join(name.trim_end_matches(".lock"));
        if !data_file.exists() {
            // Orphaned: the data file is gone, nothing left to protect.
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
            continue;
        }

        let alive = match read_lock_pid(&path).await {
            Some(pid) => is_pid_alive(pid),
            None => false,
        };
        if !alive && tokio::fs::remove_file(&path).await.is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}
