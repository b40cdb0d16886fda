//! Append-only JSONL recorder for a single session (§4.H).
//!
//! One [`Recorder`] owns exactly one session file for its lifetime: it
//! creates the file and its sidecar PID lock on construction, serializes
//! appends behind a mutex so lines never interleave and `seq` is strictly
//! increasing, and removes the lock on `close()`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use tracing::{debug, instrument};

use crate::lock::SessionLock;
use crate::types::{ContentPayload, SessionRecordLine, SessionStartPayload};
use llmrelay_core::content::Content;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock error: {0}")]
    Lock(#[from] crate::lock::LockError),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

/// Sanitize a session id for filesystem use — only alphanumerics, `-`, `_`.
fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(255)
        .collect()
}

pub fn session_file_path(chats_dir: &Path, session_id: &str) -> PathBuf {
    chats_dir.join(format!("session-{}.jsonl", sanitize_session_id(session_id)))
}

pub struct Recorder {
    file: Mutex<tokio::fs::File>,
    lock: Option<SessionLock>,
    seq: AtomicU64,
    path: PathBuf,
}

impl Recorder {
    /// Create `session-<id>.jsonl` and its sidecar lock, then write the
    /// `session_start` header line.
    #[instrument(skip(start), fields(session_id = %start.session_id))]
    pub async fn start(chats_dir: &Path, start: SessionStartPayload) -> Result<Self> {
        tokio::fs::create_dir_all(chats_dir).await?;
        let path = session_file_path(chats_dir, &start.session_id);

        let lock = SessionLock::acquire(&path).await?;
        debug!(path = %path.display(), "session recording started");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let recorder = Self {
            file: Mutex::new(file),
            lock: Some(lock),
            seq: AtomicU64::new(0),
            path,
        };

        let payload = serde_json::to_value(&start)?;
        recorder.append_line("session_start", payload).await?;
        Ok(recorder)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record_content(&self, content: &Content) -> Result<()> {
        let payload = serde_json::to_value(ContentPayload { content: content.clone() })?;
        self.append_line("content", payload).await
    }

    pub async fn record(&self, record_type: &str, payload: serde_json::Value) -> Result<()> {
        self.append_line(record_type, payload).await
    }

    async fn append_line(&self, record_type: &str, payload: serde_json::Value) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let line = SessionRecordLine::new(seq, record_type, payload);
        let mut json = serde_json::to_string(&line)?;
        json.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Remove the sidecar lock, signaling a clean shutdown. The data file
    /// is left in place.
    pub async fn close(mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            lock.release().await?;
        }
        debug!(path = %self.path.display(), "session recording closed");
        Ok(())
    }
}
