//! Streaming tool-call pipeline (§4.D).
//!
//! Providers deliver tool-call fragments as `{index, id?, name?, argsChunk?}`
//! spread across many deltas. This module accumulates fragments per index,
//! in arrival order, and finalizes each into a normalized call record whose
//! `args` is always a JSON object (or `{value: <string>}` when the
//! accumulated text could not be parsed as one).

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct ToolCallFragment {
    pub id: Option<String>,
    pub name: Option<String>,
    args_buffer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedToolCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolNameValidation {
    pub valid: bool,
    pub corrected_name: Option<String>,
    pub reason: Option<String>,
}

/// Accumulates fragments for one in-flight streaming call, keyed by the
/// provider's reported index — a `BTreeMap` so finalization iterates in
/// index order.
#[derive(Debug, Clone, Default)]
pub struct ToolCallAccumulator {
    fragments: BTreeMap<u32, ToolCallFragment>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u32, id: Option<&str>, name: Option<&str>, args_chunk: Option<&str>) {
        let fragment = self.fragments.entry(index).or_default();

        // First fragment with a non-empty id wins; later fragments reuse it.
        if fragment.id.is_none() {
            if let Some(id) = id {
                if !id.is_empty() {
                    fragment.id = Some(id.to_string());
                }
            }
        }

        // name: take the first non-empty value supplied.
        if fragment.name.is_none() {
            if let Some(name) = name {
                if !name.is_empty() {
                    fragment.name = Some(name.to_string());
                }
            }
        }

        if let Some(chunk) = args_chunk {
            fragment.args_buffer.push_str(chunk);
        }
    }

    /// Finalize every accumulated index into a normalized call. Unknown
    /// names fall back to a sentinel; args are robustly parsed.
    pub fn finalize(&self) -> Vec<NormalizedToolCall> {
        self.fragments
            .iter()
            .map(|(index, fragment)| NormalizedToolCall {
                index: *index,
                id: fragment.id.clone().unwrap_or_else(|| format!("unknown_{index}")),
                name: fragment
                    .name
                    .clone()
                    .unwrap_or_else(|| "__unknown_tool__".to_string()),
                args: repair_json(&fragment.args_buffer),
            })
            .collect()
    }
}

/// Lowercase + trim a tool name, then validate it against the registry:
/// case-insensitive exact match first, then an unambiguous prefix match.
pub fn validate_tool_name(name: &str, available: &[String]) -> ToolNameValidation {
    let normalized = name.trim().to_lowercase();

    if let Some(exact) = available.iter().find(|t| t.to_lowercase() == normalized) {
        return ToolNameValidation {
            valid: true,
            corrected_name: if exact == name {
                None
            } else {
                Some(exact.clone())
            },
            reason: None,
        };
    }

    let prefix_matches: Vec<&String> = available
        .iter()
        .filter(|t| t.to_lowercase().starts_with(&normalized))
        .collect();

    match prefix_matches.as_slice() {
        [single] => ToolNameValidation {
            valid: true,
            corrected_name: Some((*single).clone()),
            reason: Some(format!("matched unambiguous prefix of '{name}'")),
        },
        [] => ToolNameValidation {
            valid: false,
            corrected_name: None,
            reason: Some(format!("no tool named '{name}' in registry")),
        },
        _ => ToolNameValidation {
            valid: false,
            corrected_name: None,
            reason: Some(format!("'{name}' is an ambiguous prefix of multiple tools")),
        },
    }
}

/// Tolerant JSON parse for accumulated streaming tool-call arguments.
///
/// Handles: an empty buffer (treated as `{}`), unbalanced trailing braces
/// from a truncated stream, and doubled backslash-escaped quotes some
/// providers emit. Falls back to `{"value": <string>}` rather than
/// discarding the content when nothing can be recovered.
pub fn repair_json(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return value;
        }
        return serde_json::json!({ "value": value });
    }

    // Truncated-brace repair: append missing closing braces/brackets.
    let mut depth_curly = 0i32;
    let mut depth_square = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth_curly += 1,
            '}' if !in_string => depth_curly -= 1,
            '[' if !in_string => depth_square += 1,
            ']' if !in_string => depth_square -= 1,
            _ => {}
        }
    }

    let mut repaired = trimmed.to_string();
    if in_string {
        repaired.push('"');
    }
    for _ in 0..depth_square.max(0) {
        repaired.push(']');
    }
    for _ in 0..depth_curly.max(0) {
        repaired.push('}');
    }

    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        if value.is_object() {
            return value;
        }
        return serde_json::json!({ "value": value });
    }

    // Double-escaped-string repair: providers sometimes double-escape the
    // whole blob as a JSON string literal.
    if let Ok(Value::String(unescaped)) = serde_json::from_str::<Value>(&format!("\"{trimmed}\""))
    {
        if let Ok(value) = serde_json::from_str::<Value>(&unescaped) {
            if value.is_object() {
                return value;
            }
        }
    }

    serde_json::json!({ "value": trimmed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_id_wins_later_fragments_reuse_it() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("call_1"), Some("search"), Some("{\"q\":"));
        acc.push(0, None, None, Some("\"rust\"}"));
        let calls = acc.finalize();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].args, serde_json::json!({"q": "rust"}));
    }

    #[test]
    fn args_concatenate_in_arrival_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("id"), Some("tool"), Some("{\"a\":1,"));
        acc.push(0, None, None, Some("\"b\":2}"));
        let calls = acc.finalize();
        assert_eq!(calls[0].args, serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn truncated_json_is_repaired() {
        let v = repair_json("{\"a\":1,\"b\":{\"c\":2");
        assert_eq!(v, serde_json::json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn unparseable_json_is_wrapped_as_value() {
        let v = repair_json("not json at all {{{");
        assert_eq!(v["value"], serde_json::json!("not json at all {{{"));
    }

    #[test]
    fn empty_buffer_is_empty_object() {
        assert_eq!(repair_json(""), serde_json::json!({}));
    }

    #[test]
    fn validate_exact_case_insensitive() {
        let available = vec!["GetWeather".to_string()];
        let result = validate_tool_name("getweather", &available);
        assert!(result.valid);
        assert_eq!(result.corrected_name, Some("GetWeather".to_string()));
    }

    #[test]
    fn validate_unambiguous_prefix() {
        let available = vec!["search_web".to_string()];
        let result = validate_tool_name("search", &available);
        assert!(result.valid);
        assert_eq!(result.corrected_name, Some("search_web".to_string()));
    }

    #[test]
    fn validate_ambiguous_prefix_is_invalid() {
        let available = vec!["search_web".to_string(), "search_files".to_string()];
        let result = validate_tool_name("search", &available);
        assert!(!result.valid);
    }

    #[test]
    fn validate_unknown_tool_is_invalid() {
        let available = vec!["search_web".to_string()];
        let result = validate_tool_name("teleport", &available);
        assert!(!result.valid);
    }

    #[test]
    fn multiple_indices_accumulate_independently() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("call_1"), Some("a"), Some("{}"));
        acc.push(1, Some("call_2"), Some("b"), Some("{}"));
        let calls = acc.finalize();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[1].index, 1);
    }
}
