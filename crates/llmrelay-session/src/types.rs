//! On-disk record shapes (§3, §6): one JSON object per JSONL line.

use llmrelay_core::content::Content;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{v=1, seq, ts, type, payload}` — one line of a session file.
///
/// `payload` is left as a raw [`Value`] rather than an inner enum so that
/// lines carrying a `type` this crate doesn't recognize still deserialize
/// (§6: "lines preserving unknown type values must not abort iteration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecordLine {
    pub v: u32,
    pub seq: u64,
    pub ts: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub record_type: String,
    pub payload: Value,
}

impl SessionRecordLine {
    pub fn new(seq: u64, record_type: impl Into<String>, payload: Value) -> Self {
        Self {
            v: 1,
            seq,
            ts: chrono::Utc::now(),
            record_type: record_type.into(),
            payload,
        }
    }
}

/// The required first line of every session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartPayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "projectHash")]
    pub project_hash: String,
    #[serde(rename = "workspaceDirs")]
    pub workspace_dirs: Vec<String>,
    pub provider: String,
    pub model: String,
    #[serde(rename = "startTime")]
    pub start_time: chrono::DateTime<chrono::Utc>,
}

/// A `type=content` line's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPayload {
    pub content: Content,
}

/// One entry returned by [`crate::discovery::list_sessions`]: the decoded
/// header plus filesystem metadata needed for sorting and cleanup.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_hash: String,
    pub provider: String,
    pub model: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub file_path: std::path::PathBuf,
    pub modified: std::time::SystemTime,
}
