//! Session discovery: directory scan with header-only reads, preview
//! extraction, and ref resolution (§4.H).

use std::path::{Path, PathBuf};

use llmrelay_core::content::{Block, Speaker};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use crate::types::{SessionRecordLine, SessionStartPayload, SessionSummary};

const HEADER_PEEK_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no session matches '{0}'")]
    NotFound(String),
    #[error("'{0}' matches more than one session")]
    Ambiguous(String),
}

/// Strip a leading UTF-8 BOM, if present (§6).
fn strip_bom(s: &str) -> &str {
    s.strip_prefix('\u{feff}').unwrap_or(s)
}

async fn read_header_line(path: &Path) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = vec![0u8; HEADER_PEEK_BYTES];
    let n = file.read(&mut buf).await.ok()?;
    buf.truncate(n);

    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
        return Some(line);
    }

    // Header line exceeds the peek window: fall back to a full
    // line-by-line read.
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut lines = BufReader::new(file).lines();
    lines.next_line().await.ok().flatten()
}

fn parse_header(line: &str) -> Option<SessionStartPayload> {
    let line = strip_bom(line.trim());
    if line.is_empty() {
        return None;
    }
    let record: SessionRecordLine = serde_json::from_str(line).ok()?;
    if record.record_type != "session_start" {
        return None;
    }
    serde_json::from_value(record.payload).ok()
}

async fn session_files(chats_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(chats_dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with("session-") && name.ends_with(".jsonl") {
            files.push(path);
        }
    }
    Ok(files)
}

/// Enumerate sessions for one project, newest-first (ties broken by
/// `sessionId` descending).
pub async fn list_sessions(chats_dir: &Path, project_hash: &str) -> std::io::Result<Vec<SessionSummary>> {
    let (sessions, _skipped) = list_sessions_detailed(chats_dir, project_hash).await?;
    Ok(sessions)
}

/// As [`list_sessions`], additionally reporting how many candidate files
/// failed to parse as a valid header.
pub async fn list_sessions_detailed(
    chats_dir: &Path,
    project_hash: &str,
) -> std::io::Result<(Vec<SessionSummary>, usize)> {
    let files = session_files(chats_dir).await?;
    let mut sessions = Vec::new();
    let mut skipped = 0usize;

    for path in files {
        let Some(line) = read_header_line(&path).await else {
            skipped += 1;
            continue;
        };
        let Some(header) = parse_header(&line) else {
            skipped += 1;
            continue;
        };
        if header.project_hash != project_hash {
            continue;
        }
        let Ok(metadata) = tokio::fs::metadata(&path).await else {
            skipped += 1;
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            skipped += 1;
            continue;
        };

        sessions.push(SessionSummary {
            session_id: header.session_id,
            project_hash: header.project_hash,
            provider: header.provider,
            model: header.model,
            start_time: header.start_time,
            file_path: path,
            modified,
        });
    }

    sessions.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.session_id.cmp(&a.session_id)));
    Ok((sessions, skipped))
}

/// True iff at least one line after the header is a non-blank, valid
/// `type=content` record.
pub async fn has_content_events(file_path: &Path) -> bool {
    let Ok(file) = tokio::fs::File::open(file_path).await else {
        return false;
    };
    let mut lines = BufReader::new(file).lines();
    let mut seen_header = false;

    loop {
        let Ok(Some(line)) = lines.next_line().await else {
            return false;
        };
        let line = strip_bom(line.trim());
        if line.is_empty() {
            continue;
        }
        if !seen_header {
            seen_header = true;
            continue;
        }
        let Ok(record) = serde_json::from_str::<SessionRecordLine>(line) else {
            continue;
        };
        if record.record_type == "content" {
            return true;
        }
    }
}

/// Scan for the first `content` line whose speaker is `human`, concatenate
/// its `Text` blocks (skipping `Media`), and truncate to `max_len`
/// characters. Never panics or returns an error — any I/O or parse failure
/// yields `None` (§4.H).
pub async fn read_first_user_message(file_path: &Path, max_len: usize) -> Option<String> {
    let file = tokio::fs::File::open(file_path).await.ok()?;
    let mut lines = BufReader::new(file).lines();
    let mut seen_header = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => return None,
        };
        let line = strip_bom(line.trim());
        if line.is_empty() {
            continue;
        }
        if !seen_header {
            seen_header = true;
            continue;
        }

        let Ok(record) = serde_json::from_str::<SessionRecordLine>(line) else {
            continue;
        };
        if record.record_type != "content" {
            continue;
        }
        let Ok(payload) = serde_json::from_value::<crate::types::ContentPayload>(record.payload) else {
            continue;
        };
        if payload.content.speaker != Speaker::Human {
            continue;
        }

        let text: String = payload
            .content
            .blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        let truncated: String = text.chars().take(max_len).collect();
        return Some(truncated);
    }
}

/// Resolve a user-supplied reference against a list of sessions (newest-
/// first, as returned by [`list_sessions`]): exact id match, then a
/// 1-based index if `ref_str` is all digits, then a unique id prefix.
pub fn resolve_session_ref(ref_str: &str, sessions: &[SessionSummary]) -> Result<usize, ResolveError> {
    if let Some(idx) = sessions.iter().position(|s| s.session_id == ref_str) {
        return Ok(idx);
    }

    if !ref_str.is_empty() && ref_str.chars().all(|c| c.is_ascii_digit()) {
        let n: usize = ref_str.parse().map_err(|_| ResolveError::NotFound(ref_str.to_string()))?;
        if n >= 1 && n <= sessions.len() {
            return Ok(n - 1);
        }
        return Err(ResolveError::NotFound(ref_str.to_string()));
    }

    let matches: Vec<usize> = sessions
        .iter()
        .enumerate()
        .filter(|(_, s)| s.session_id.starts_with(ref_str))
        .map(|(i, _)| i)
        .collect();

    match matches.len() {
        0 => Err(ResolveError::NotFound(ref_str.to_string())),
        1 => Ok(matches[0]),
        _ => Err(ResolveError::Ambiguous(ref_str.to_string())),
    }
}
