//! Synthetic tool-response repair (§4.C).
//!
//! Patches orphaned tool calls — ones with no matching `ToolResponse` —
//! with a synthetic cancellation response, inserted immediately after the
//! AI turn that raised them. Pure function on a history slice: never
//! mutates its input, always returns a deep copy, and is idempotent.

use chrono::Utc;
use serde_json::json;

use crate::content::{Block, Content, Speaker};
use crate::tool_ids::to_history_id;

fn cancellation_payload(tool_name: &str) -> serde_json::Value {
    json!({
        "status": "cancelled",
        "message": "Tool execution cancelled by user",
        "toolName": tool_name,
        "timestamp": Utc::now().to_rfc3339(),
        "error_type": "user_interruption",
    })
}

fn normalize_ids(history: &[Content]) -> Vec<Content> {
    history
        .iter()
        .cloned()
        .map(|mut content| {
            for block in &mut content.blocks {
                match block {
                    Block::ToolCall { id, .. } => *id = to_history_id(id),
                    Block::ToolResponse { call_id, .. } => *call_id = to_history_id(call_id),
                    _ => {}
                }
            }
            content
        })
        .collect()
}

/// Inject a synthetic cancellation `ToolResponse` for every `ToolCall` on
/// the history that has no matching `ToolResponse.callId`.
pub fn patch_orphan_tool_calls(history: &[Content]) -> Vec<Content> {
    let normalized = normalize_ids(history);

    let mut responded: std::collections::HashSet<String> = std::collections::HashSet::new();
    for content in &normalized {
        for call_id in content.tool_responses() {
            responded.insert(call_id.to_string());
        }
    }

    // Map each orphaned call id -> (ai turn index, tool name). Later AI
    // turns with the same id overwrite earlier ones, so we match the
    // *last* AI turn bearing the orphan call.
    let mut orphan_turn: std::collections::HashMap<String, (usize, String)> =
        std::collections::HashMap::new();
    for (idx, content) in normalized.iter().enumerate() {
        if content.speaker != Speaker::Ai {
            continue;
        }
        for (id, name, _) in content.tool_calls() {
            if !responded.contains(id) {
                orphan_turn.insert(id.to_string(), (idx, name.to_string()));
            }
        }
    }

    if orphan_turn.is_empty() {
        return normalized;
    }

    // Group orphans by the AI turn index they should be inserted after.
    let mut by_turn: std::collections::BTreeMap<usize, Vec<(String, String)>> =
        std::collections::BTreeMap::new();
    for (call_id, (idx, name)) in orphan_turn {
        by_turn.entry(idx).or_default().push((call_id, name));
    }
    for entries in by_turn.values_mut() {
        entries.sort();
    }

    let mut result = Vec::with_capacity(normalized.len());
    for (idx, content) in normalized.into_iter().enumerate() {
        result.push(content);
        if let Some(entries) = by_turn.get(&idx) {
            for (call_id, tool_name) in entries {
                let synthetic = Content::new(
                    Speaker::Tool,
                    vec![Block::ToolResponse {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        result: cancellation_payload(tool_name),
                        is_error: Some(true),
                        error: Some("Tool execution cancelled by user".to_string()),
                    }],
                )
                .with_metadata_flag("synthetic", true.into());
                result.push(synthetic);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ai_with_tool_call(id: &str, name: &str) -> Content {
        Content::new(
            Speaker::Ai,
            vec![Block::ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                parameters: json!({}),
            }],
        )
    }

    fn tool_response(call_id: &str) -> Content {
        Content::new(
            Speaker::Tool,
            vec![Block::ToolResponse {
                call_id: call_id.to_string(),
                tool_name: "whatever".into(),
                result: json!({"ok": true}),
                is_error: None,
                error: None,
            }],
        )
    }

    fn blocks_equal_ignoring_timestamp(a: &[Content], b: &[Content]) -> bool {
        // timestamps inside synthetic payloads differ by wall clock, so
        // compare everything except that one field.
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b.iter()).all(|(ca, cb)| {
            ca.speaker == cb.speaker && ca.blocks.len() == cb.blocks.len() && ca.is_synthetic() == cb.is_synthetic()
        })
    }

    #[test]
    fn patches_orphan_call_with_cancellation() {
        let history = vec![ai_with_tool_call("hist_tool_abc", "search")];
        let patched = patch_orphan_tool_calls(&history);
        assert_eq!(patched.len(), 2);
        assert!(patched[1].is_synthetic());
        match &patched[1].blocks[0] {
            Block::ToolResponse { call_id, tool_name, .. } => {
                assert_eq!(call_id, "hist_tool_abc");
                assert_eq!(tool_name, "search");
            }
            _ => panic!("expected tool response"),
        }
    }

    #[test]
    fn does_not_patch_answered_calls() {
        let history = vec![
            ai_with_tool_call("hist_tool_abc", "search"),
            tool_response("hist_tool_abc"),
        ];
        let patched = patch_orphan_tool_calls(&history);
        assert_eq!(patched.len(), 2);
    }

    #[test]
    fn wire_form_ids_are_normalized_before_audit() {
        let history = vec![
            ai_with_tool_call("hist_tool_abc", "search"),
            tool_response("call_abc"),
        ];
        let patched = patch_orphan_tool_calls(&history);
        // call_abc normalizes to hist_tool_abc, matching the call -> no orphan
        assert_eq!(patched.len(), 2);
    }

    #[test]
    fn idempotent() {
        let history = vec![ai_with_tool_call("hist_tool_abc", "search")];
        let once = patch_orphan_tool_calls(&history);
        let twice = patch_orphan_tool_calls(&once);
        assert!(blocks_equal_ignoring_timestamp(&once, &twice));
    }

    #[test]
    fn never_mutates_input() {
        let history = vec![ai_with_tool_call("hist_tool_abc", "search")];
        let history_copy = history.clone();
        let _ = patch_orphan_tool_calls(&history);
        assert_eq!(history, history_copy);
    }

    #[test]
    fn matches_last_ai_turn_bearing_the_orphan() {
        let history = vec![
            ai_with_tool_call("hist_tool_dup", "first_tool"),
            ai_with_tool_call("hist_tool_dup", "second_tool"),
        ];
        let patched = patch_orphan_tool_calls(&history);
        // Only one synthetic response should be attached, to the last turn.
        assert_eq!(patched.len(), 3);
        match &patched[2].blocks[0] {
            Block::ToolResponse { tool_name, .. } => assert_eq!(tool_name, "second_tool"),
            _ => panic!("expected tool response"),
        }
    }
}
