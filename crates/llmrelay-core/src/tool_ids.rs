//! Deterministic rewrites between the canonical history tool-call id form
//! (`hist_tool_<suffix>`) and the two wire forms (`call_<suffix>` for
//! OpenAI, `toolu_<suffix>` for Anthropic).
//!
//! All three functions are pure and must stay that way — §8 property-tests
//! the round trip and the per-call stability of the wire encoders.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const HISTORY_PREFIX: &str = "hist_tool_";
const OPENAI_PREFIX: &str = "call_";
const ANTHROPIC_PREFIX: &str = "toolu_";
const MIN_ID_LEN: usize = 6;

/// Rewrite any recognized wire id (or opaque id) into canonical history form.
pub fn to_history_id(id: &str) -> String {
    if let Some(suffix) = id.strip_prefix(OPENAI_PREFIX) {
        return format!("{HISTORY_PREFIX}{suffix}");
    }
    if let Some(suffix) = id.strip_prefix(ANTHROPIC_PREFIX) {
        return format!("{HISTORY_PREFIX}{suffix}");
    }
    if id.starts_with(HISTORY_PREFIX) {
        return id.to_string();
    }
    format!("{HISTORY_PREFIX}{id}")
}

fn sanitized_suffix(id: &str) -> String {
    let raw = id
        .strip_prefix(HISTORY_PREFIX)
        .or_else(|| id.strip_prefix(OPENAI_PREFIX))
        .or_else(|| id.strip_prefix(ANTHROPIC_PREFIX))
        .unwrap_or(id);

    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Deterministic (within a process) replacement suffix for an id whose
/// sanitized suffix came out empty. Not guaranteed stable across processes.
fn fallback_suffix(id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    let digest = hasher.finish();
    let suffix = format!("{digest:x}");
    let take = suffix.len().min(8).max(MIN_ID_LEN);
    suffix[..take].to_string()
}

fn to_wire_id(id: &str, prefix: &str) -> String {
    let mut suffix = sanitized_suffix(id);
    if suffix.is_empty() {
        suffix = fallback_suffix(id);
    }
    let candidate = format!("{prefix}{suffix}");
    if candidate.len() < MIN_ID_LEN {
        let pad = fallback_suffix(id);
        format!("{prefix}{suffix}{pad}")
    } else {
        candidate
    }
}

/// Translate any id into OpenAI wire form (`call_<suffix>`).
pub fn to_openai_id(id: &str) -> String {
    to_wire_id(id, OPENAI_PREFIX)
}

/// Translate any id into Anthropic wire form (`toolu_<suffix>`).
pub fn to_anthropic_id(id: &str) -> String {
    to_wire_id(id, ANTHROPIC_PREFIX)
}
