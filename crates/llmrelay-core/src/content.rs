//! The neutral conversation element shared by every provider adapter.
//!
//! `Content` is never mutated in place after it is appended to a history;
//! adapters convert it to and from provider wire form but the owner's copy
//! stays immutable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Human,
    Ai,
    Tool,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaEncoding {
    Base64,
    Url,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Media {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
        encoding: MediaEncoding,
    },
    ToolCall {
        id: String,
        name: String,
        parameters: Value,
    },
    ToolResponse {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[serde(rename = "isError")]
        is_error: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Thinking {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub speaker: Speaker,
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Content {
    pub fn new(speaker: Speaker, blocks: Vec<Block>) -> Self {
        Self {
            speaker,
            blocks,
            metadata: None,
        }
    }

    pub fn text(speaker: Speaker, text: impl Into<String>) -> Self {
        Self::new(speaker, vec![Block::Text { text: text.into() }])
    }

    /// Concatenation of every `Text` block, skipping `Media`/other blocks.
    pub fn text_content(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.blocks.iter().filter_map(|b| match b {
            Block::ToolCall {
                id,
                name,
                parameters,
            } => Some((id.as_str(), name.as_str(), parameters)),
            _ => None,
        })
    }

    pub fn tool_responses(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().filter_map(|b| match b {
            Block::ToolResponse { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
    }

    pub fn is_synthetic(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("synthetic"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn usage(&self) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get("usage"))
    }

    pub fn with_metadata_flag(mut self, key: &str, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_concatenates_text_blocks_only() {
        let content = Content::new(
            Speaker::Human,
            vec![
                Block::Text {
                    text: "hello ".into(),
                },
                Block::Media {
                    mime_type: "image/png".into(),
                    data: "abc".into(),
                    encoding: MediaEncoding::Base64,
                },
                Block::Text {
                    text: "world".into(),
                },
            ],
        );
        assert_eq!(content.text_content(), "hello world");
    }

    #[test]
    fn synthetic_flag_roundtrips() {
        let content =
            Content::text(Speaker::Tool, "cancelled").with_metadata_flag("synthetic", true.into());
        assert!(content.is_synthetic());
    }

    #[test]
    fn serde_round_trip_preserves_tool_call() {
        let content = Content::new(
            Speaker::Ai,
            vec![Block::ToolCall {
                id: "hist_tool_abc".into(),
                name: "get_weather".into(),
                parameters: serde_json::json!({"city": "NYC"}),
            }],
        );
        let json = serde_json::to_string(&content).unwrap();
        let back: Content = serde_json::from_str(&json).unwrap();
        assert_eq!(content, back);
    }
}
