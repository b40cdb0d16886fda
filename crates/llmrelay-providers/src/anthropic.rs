//! Anthropic Messages API adapter.
//!
//! Grounded on the egress connector's Anthropic connector: `x-api-key` +
//! `anthropic-version` headers instead of a bearer token, the
//! `system`-message-extracted-from-`messages[]` request shape, and the
//! `MessageStart`/`ContentBlockStart`/`ContentBlockDelta`/`ContentBlockStop`/
//! `MessageDelta`/`MessageStop` SSE state machine.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use llmrelay_core::content::{Block, Content, Speaker};
use llmrelay_core::error::{Error, Result};
use llmrelay_core::provider::{
    ContentStream, ModelInfo, NeutralStreamEvent, Provider, ProviderCallOptions,
    ProviderCapabilities, ResolvedCall, ToolFormat,
};
use llmrelay_core::repair::patch_orphan_tool_calls;
use llmrelay_core::settings::Streaming;
use llmrelay_core::tool_ids::{to_anthropic_id, to_history_id};
use llmrelay_retry::{BucketFailover, NoFailover, RetryOptions};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::common::{apply_auth_and_headers, retrying_stream, send_with_retry, TransportError};

pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: Client,
    api_version: String,
    retry_opts: RetryOptions,
    failover: Arc<dyn BucketFailover>,
}

impl AnthropicProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_version: DEFAULT_API_VERSION.to_string(),
            retry_opts: RetryOptions::default(),
            failover: Arc::new(NoFailover),
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_retry_opts(mut self, retry_opts: RetryOptions) -> Self {
        self.retry_opts = retry_opts;
        self
    }

    pub fn with_failover(mut self, failover: Arc<dyn BucketFailover>) -> Self {
        self.failover = failover;
        self
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, options, resolved), fields(provider = "anthropic"))]
    async fn generate(&self, options: ProviderCallOptions, resolved: ResolvedCall) -> Result<ContentStream> {
        let repaired = patch_orphan_tool_calls(&options.contents);
        let request = to_anthropic_request(&repaired, &options, &resolved);
        let streaming_disabled = matches!(resolved.streaming, Streaming::Disabled);

        let url = format!("{}/v1/messages", resolved.base_url.trim_end_matches('/'));
        let client = self.client.clone();
        let api_version = self.api_version.clone();
        let retry_opts = self.retry_opts;
        let failover = self.failover.clone();

        let build_request = move || {
            let builder = apply_auth_and_headers(client.post(&url).json(&request), &resolved, "x-api-key");
            builder.header("anthropic-version", &api_version)
        };

        if streaming_disabled {
            let response = send_with_retry("anthropic", retry_opts, failover.as_ref(), build_request).await?;
            let body: AnthropicResponse = response
                .json()
                .await
                .map_err(TransportError::Http)
                .map_err(|e| e.into_core_error("anthropic"))?;
            let usage = body.usage.clone();
            let content = from_anthropic_response(body);
            let mut events = vec![Ok::<NeutralStreamEvent, Error>(NeutralStreamEvent::Content(content))];
            if let Some(usage) = usage {
                let raw = serde_json::to_value(&usage).unwrap_or(Value::Null);
                let normalized = crate::usage::from_anthropic_usage(&raw);
                events.push(Ok(NeutralStreamEvent::Usage(normalized.to_metadata_value())));
            }
            let stream = futures::stream::iter(events);
            return Ok(Box::pin(stream) as ContentStream);
        }

        Ok(retrying_stream(retry_opts, move || {
            let build_request = build_request.clone();
            let failover = failover.clone();
            async move {
                let response = send_with_retry("anthropic", retry_opts, failover.as_ref(), build_request).await?;
                Ok(create_anthropic_stream(response))
            }
        }))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![
            ModelInfo { id: "claude-3-5-sonnet-20241022".into(), display_name: Some("Claude 3.5 Sonnet".into()) },
            ModelInfo { id: "claude-3-5-haiku-20241022".into(), display_name: Some("Claude 3.5 Haiku".into()) },
        ])
    }

    fn get_default_model(&self) -> String {
        DEFAULT_MODEL.to_string()
    }

    fn get_tool_format(&self) -> ToolFormat {
        ToolFormat::Anthropic
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_vision: true,
        }
    }
}

// Wire types

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn to_anthropic_request(
    history: &[Content],
    options: &ProviderCallOptions,
    resolved: &ResolvedCall,
) -> AnthropicRequest {
    let system = history
        .iter()
        .find(|c| c.speaker == Speaker::System)
        .map(|c| c.text_content());

    let known_call_ids: std::collections::HashSet<String> = history
        .iter()
        .flat_map(|c| c.tool_calls().map(|(id, _, _)| to_anthropic_id(id)))
        .collect();

    let messages: Vec<AnthropicMessage> = history
        .iter()
        .filter(|c| c.speaker != Speaker::System)
        .map(|content| {
            let role = match content.speaker {
                Speaker::Human | Speaker::Tool => "user",
                Speaker::Ai => "assistant",
                Speaker::System => unreachable!("filtered above"),
            }
            .to_string();

            let mut blocks = Vec::new();
            let text = content.text_content();
            if !text.is_empty() {
                blocks.push(AnthropicContentBlock::Text { text });
            }
            for (id, name, params) in content.tool_calls() {
                blocks.push(AnthropicContentBlock::ToolUse {
                    id: to_anthropic_id(id),
                    name: name.to_string(),
                    input: params.clone(),
                });
            }
            for block in &content.blocks {
                if let Block::ToolResponse { call_id, result, is_error, .. } = block {
                    let wire_id = to_anthropic_id(call_id);
                    if !known_call_ids.contains(&wire_id) {
                        let err = Error::ToolHistory(format!("no matching tool_use for response id {wire_id}"));
                        warn!(%err, call_id = %wire_id, "dropping orphan tool_result before it reaches the wire");
                        continue;
                    }
                    blocks.push(AnthropicContentBlock::ToolResult {
                        tool_use_id: wire_id,
                        content: result.to_string(),
                        is_error: *is_error,
                    });
                }
            }

            AnthropicMessage {
                role,
                content: AnthropicContent::Blocks(blocks),
            }
        })
        .collect();

    let tools = if options.tools.is_empty() {
        None
    } else {
        Some(
            options
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
        )
    };

    let max_tokens = resolved
        .request_params
        .get("max_tokens")
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    let temperature = resolved.request_params.get("temperature").and_then(Value::as_f64);

    AnthropicRequest {
        model: resolved.model.clone(),
        messages,
        max_tokens,
        system,
        temperature,
        stream: matches!(resolved.streaming, Streaming::Enabled),
        tools,
    }
}

fn from_anthropic_response(resp: AnthropicResponse) -> Content {
    let mut blocks = Vec::new();
    for block in resp.content {
        match block {
            AnthropicContentBlock::Text { text } => blocks.push(Block::Text { text }),
            AnthropicContentBlock::ToolUse { id, name, input } => {
                blocks.push(Block::ToolCall {
                    id: to_history_id(&id),
                    name,
                    parameters: input,
                });
            }
            AnthropicContentBlock::ToolResult { .. } => {
                debug!("unexpected tool_result block in anthropic response content");
            }
        }
    }

    let mut content = Content::new(Speaker::Ai, blocks);
    if let Some(reason) = resp.stop_reason {
        content = content.with_metadata_flag("stop_reason", Value::String(reason));
    }
    content
}

// Streaming

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        #[serde(default)]
        message: Option<Value>,
    },
    ContentBlockStart {
        index: u32,
        content_block: AnthropicStreamContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: AnthropicStreamDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Default)]
struct StreamState {
    tool_call: Option<(String, String)>,
    tool_args_buffer: String,
}

fn create_anthropic_stream(response: reqwest::Response) -> ContentStream {
    let byte_stream = response.bytes_stream();
    let event_stream = eventsource_stream::EventStream::new(byte_stream);

    let stream = event_stream.scan(StreamState::default(), |state, result| {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                return futures::future::ready(Some(Err(Error::StreamInterrupted {
                    provider: "anthropic".into(),
                    message: e.to_string(),
                })));
            }
        };

        let parsed: AnthropicStreamEvent = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unparsable anthropic stream event");
                return futures::future::ready(Some(Ok(None)));
            }
        };

        match parsed {
            AnthropicStreamEvent::ContentBlockStart { content_block: AnthropicStreamContentBlock::ToolUse { id, name }, .. } => {
                state.tool_call = Some((id, name));
                state.tool_args_buffer.clear();
                futures::future::ready(Some(Ok(None)))
            }
            AnthropicStreamEvent::ContentBlockStart { .. } => futures::future::ready(Some(Ok(None))),
            AnthropicStreamEvent::ContentBlockDelta { delta: AnthropicStreamDelta::TextDelta { text }, .. } => {
                futures::future::ready(Some(Ok(Some(NeutralStreamEvent::Content(Content::text(
                    Speaker::Ai,
                    text,
                ))))))
            }
            AnthropicStreamEvent::ContentBlockDelta { delta: AnthropicStreamDelta::InputJsonDelta { partial_json }, .. } => {
                state.tool_args_buffer.push_str(&partial_json);
                futures::future::ready(Some(Ok(None)))
            }
            AnthropicStreamEvent::ContentBlockStop { .. } => {
                if let Some((id, name)) = state.tool_call.take() {
                    let args = serde_json::from_str(&state.tool_args_buffer)
                        .unwrap_or(Value::Object(Default::default()));
                    state.tool_args_buffer.clear();
                    return futures::future::ready(Some(Ok(Some(NeutralStreamEvent::Content(
                        Content::new(
                            Speaker::Ai,
                            vec![Block::ToolCall {
                                id: to_history_id(&id),
                                name,
                                parameters: args,
                            }],
                        ),
                    )))));
                }
                futures::future::ready(Some(Ok(None)))
            }
            AnthropicStreamEvent::MessageDelta { usage: Some(usage), .. } => {
                let raw = serde_json::json!({ "output_tokens": usage.output_tokens });
                let normalized = crate::usage::from_anthropic_usage(&raw);
                futures::future::ready(Some(Ok(Some(NeutralStreamEvent::Usage(
                    normalized.to_metadata_value(),
                )))))
            }
            _ => futures::future::ready(Some(Ok(None))),
        }
    });

    Box::pin(stream.filter_map(|item| async move {
        match item {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    })) as Pin<Box<dyn Stream<Item = Result<NeutralStreamEvent>> + Send>>
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmrelay_core::provider::{ProviderCallOptions, RuntimeScope, ToolDefinition};
    use llmrelay_core::settings::SettingsStore;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn resolved() -> ResolvedCall {
        ResolvedCall {
            model: "claude-3-5-sonnet-20241022".into(),
            base_url: DEFAULT_BASE_URL.into(),
            auth_token: Some("sk-ant-test".into()),
            custom_headers: HashMap::new(),
            request_params: HashMap::new(),
            streaming: Streaming::Enabled,
        }
    }

    fn opts(contents: Vec<Content>, tools: Vec<ToolDefinition>) -> ProviderCallOptions {
        ProviderCallOptions {
            provider_name: "anthropic".into(),
            contents,
            tools,
            settings: SettingsStore::new(Default::default()),
            runtime: RuntimeScope::new(),
            invocation: None,
            user_memory: None,
            cancellation: CancellationToken::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn system_message_is_extracted_and_excluded_from_messages() {
        let history = vec![
            Content::text(Speaker::System, "be terse"),
            Content::text(Speaker::Human, "hi"),
        ];
        let o = opts(history.clone(), vec![]);
        let req = to_anthropic_request(&history, &o, &resolved());
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
    }

    #[test]
    fn max_tokens_defaults_when_unset() {
        let history = vec![Content::text(Speaker::Human, "hi")];
        let o = opts(history.clone(), vec![]);
        let req = to_anthropic_request(&history, &o, &resolved());
        assert_eq!(req.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn tool_call_becomes_tool_use_block_with_wire_id() {
        let history = vec![Content::new(
            Speaker::Ai,
            vec![Block::ToolCall {
                id: "hist_tool_abc".into(),
                name: "search".into(),
                parameters: serde_json::json!({"q": "rust"}),
            }],
        )];
        let o = opts(history.clone(), vec![]);
        let req = to_anthropic_request(&history, &o, &resolved());
        match &req.messages[0].content {
            AnthropicContent::Blocks(blocks) => match &blocks[0] {
                AnthropicContentBlock::ToolUse { id, .. } => assert_eq!(id, "toolu_abc"),
                _ => panic!("expected tool_use block"),
            },
        }
    }

    #[test]
    fn tool_response_becomes_tool_result_in_a_user_message() {
        let history = vec![
            Content::new(
                Speaker::Ai,
                vec![Block::ToolCall {
                    id: "hist_tool_abc".into(),
                    name: "search".into(),
                    parameters: serde_json::json!({"q": "rust"}),
                }],
            ),
            Content::new(
                Speaker::Tool,
                vec![Block::ToolResponse {
                    call_id: "hist_tool_abc".into(),
                    tool_name: "search".into(),
                    result: serde_json::json!({"ok": true}),
                    is_error: None,
                    error: None,
                }],
            ),
        ];
        let o = opts(history.clone(), vec![]);
        let req = to_anthropic_request(&history, &o, &resolved());
        assert_eq!(req.messages[1].role, "user");
        match &req.messages[1].content {
            AnthropicContent::Blocks(blocks) => match &blocks[0] {
                AnthropicContentBlock::ToolResult { tool_use_id, .. } => {
                    assert_eq!(tool_use_id, "toolu_abc")
                }
                _ => panic!("expected tool_result block"),
            },
        }
    }

    #[test]
    fn orphan_tool_result_is_dropped_without_a_matching_tool_use() {
        let history = vec![Content::new(
            Speaker::Tool,
            vec![Block::ToolResponse {
                call_id: "hist_tool_nope".into(),
                tool_name: "search".into(),
                result: serde_json::json!({"ok": true}),
                is_error: None,
                error: None,
            }],
        )];
        let o = opts(history.clone(), vec![]);
        let req = to_anthropic_request(&history, &o, &resolved());
        match &req.messages[0].content {
            AnthropicContent::Blocks(blocks) => assert!(blocks.is_empty()),
        }
    }

    #[test]
    fn from_response_maps_stop_reason_into_metadata() {
        let resp = AnthropicResponse {
            content: vec![AnthropicContentBlock::Text { text: "hi".into() }],
            stop_reason: Some("end_turn".into()),
            usage: Some(AnthropicUsage { input_tokens: 10, output_tokens: 5 }),
        };
        let content = from_anthropic_response(resp);
        assert_eq!(content.text_content(), "hi");
        assert_eq!(
            content.metadata.as_ref().and_then(|m| m.get("stop_reason")).and_then(|v| v.as_str()),
            Some("end_turn")
        );
    }

    #[test]
    fn usage_normalization_maps_cache_fields() {
        let raw = serde_json::to_value(&AnthropicUsage { input_tokens: 50, output_tokens: 10 }).unwrap();
        let normalized = crate::usage::from_anthropic_usage(&raw);
        assert_eq!(normalized.prompt_tokens, 50);
        assert_eq!(normalized.completion_tokens, 10);
    }
}
