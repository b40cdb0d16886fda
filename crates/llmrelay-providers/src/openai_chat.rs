//! OpenAI Chat Completions adapter.
//!
//! Grounded on the egress connector's `to_openai_request`/
//! `from_openai_response`/`create_openai_stream` (role mapping, the
//! `tool_calls` array shape, delta accumulation via `OpenAIToolCallDelta`),
//! generalized from `NormalizedRequest`/`NormalizedResponse` onto this
//! crate's `Content`/`Block` neutral model.

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
use llmrelay_core::tool_ids::{to_history_id, to_openai_id};
use llmrelay_core::tool_stream::ToolCallAccumulator;
use llmrelay_retry::{BucketFailover, NoFailover, RetryOptions};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::common::{apply_auth_and_headers, merged_request_params, retrying_stream, send_with_retry, TransportError};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiChatProvider {
    client: Client,
    retry_opts: RetryOptions,
    failover: Arc<dyn BucketFailover>,
}

impl OpenAiChatProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry_opts: RetryOptions::default(),
            failover: Arc::new(NoFailover),
        }
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
impl Provider for OpenAiChatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, options, resolved), fields(provider = "openai"))]
    async fn generate(&self, options: ProviderCallOptions, resolved: ResolvedCall) -> Result<ContentStream> {
        let repaired = patch_orphan_tool_calls(&options.contents);
        let request = to_openai_request(&repaired, &options, &resolved)?;

        let url = format!("{}/chat/completions", resolved.base_url.trim_end_matches('/'));
        let client = self.client.clone();
        let retry_opts = self.retry_opts;
        let failover = self.failover.clone();

        if matches!(resolved.streaming, llmrelay_core::settings::Streaming::Disabled) {
            let response = send_with_retry("openai", retry_opts, failover.as_ref(), || {
                apply_auth_and_headers(client.post(&url).json(&request), &resolved, "Authorization")
            })
            .await?;

            let body: OpenAiChatResponse = response.json().await.map_err(TransportError::Http).map_err(|e| e.into_core_error("openai"))?;
            let usage = body.usage.as_ref().map(crate::usage::from_openai_usage);
            let contents = from_openai_response(body)?;
            let mut events: Vec<Result<NeutralStreamEvent>> = contents
                .into_iter()
                .map(|c| Ok(NeutralStreamEvent::Content(c)))
                .collect();
            if let Some(usage) = usage {
                events.push(Ok(NeutralStreamEvent::Usage(usage.to_metadata_value())));
            }
            let stream = futures::stream::iter(events);
            return Ok(Box::pin(stream) as ContentStream);
        }

        Ok(retrying_stream(retry_opts, move || {
            let client = client.clone();
            let url = url.clone();
            let request = request.clone();
            let resolved = resolved.clone();
            let failover = failover.clone();
            async move {
                let response = send_with_retry("openai", retry_opts, failover.as_ref(), || {
                    apply_auth_and_headers(client.post(&url).json(&request), &resolved, "Authorization")
                })
                .await?;
                Ok(create_openai_stream(response))
            }
        }))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![
            ModelInfo { id: "gpt-4o".into(), display_name: Some("GPT-4o".into()) },
            ModelInfo { id: "gpt-4o-mini".into(), display_name: Some("GPT-4o mini".into()) },
        ])
    }

    fn get_default_model(&self) -> String {
        DEFAULT_MODEL.to_string()
    }

    fn get_tool_format(&self) -> ToolFormat {
        ToolFormat::OpenAi
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

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionCallDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OpenAiFunctionCallDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn to_openai_request(
    history: &[Content],
    options: &ProviderCallOptions,
    resolved: &ResolvedCall,
) -> Result<OpenAiChatRequest> {
    let known_call_ids: std::collections::HashSet<String> = history
        .iter()
        .flat_map(|c| c.tool_calls().map(|(id, _, _)| to_openai_id(id)))
        .collect();
    let messages = history
        .iter()
        .map(|c| content_to_message(c, &known_call_ids))
        .collect::<Result<Vec<_>>>()?;

    let tools = if options.tools.is_empty() {
        None
    } else {
        Some(
            options
                .tools
                .iter()
                .map(|t| OpenAiTool {
                    tool_type: "function".into(),
                    function: OpenAiFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        )
    };

    let extra = merged_request_params(serde_json::Map::new(), resolved);
    let temperature = extra.get("temperature").and_then(Value::as_f64);
    let max_tokens = extra
        .get("max_tokens")
        .and_then(Value::as_u64)
        .map(|n| n as u32);

    Ok(OpenAiChatRequest {
        model: resolved.model.clone(),
        messages,
        temperature,
        max_tokens,
        stream: matches!(resolved.streaming, llmrelay_core::settings::Streaming::Enabled),
        tools,
        extra,
    })
}

fn content_to_message(
    content: &Content,
    known_call_ids: &std::collections::HashSet<String>,
) -> Result<OpenAiMessage> {
    let role = match content.speaker {
        Speaker::Human => "user",
        Speaker::Ai => "assistant",
        Speaker::Tool => "tool",
        Speaker::System => "system",
    }
    .to_string();

    let text = content.text_content();
    let tool_calls: Vec<OpenAiToolCall> = content
        .tool_calls()
        .map(|(id, name, params)| OpenAiToolCall {
            id: to_openai_id(id),
            tool_type: "function".into(),
            function: OpenAiFunctionCall {
                name: name.to_string(),
                arguments: params.to_string(),
            },
        })
        .collect();

    // Only wire up a tool_call_id when a matching tool call is present
    // somewhere in this same outbound request; an orphan (no paired call,
    // e.g. a truncated history window) is dropped rather than sent, since
    // the API rejects a tool message whose id it never issued.
    let tool_call_id = content.tool_responses().map(to_openai_id).find(|id| {
        if known_call_ids.contains(id) {
            true
        } else {
            let err = Error::ToolHistory(format!("no matching tool call for response id {id}"));
            warn!(%err, call_id = %id, "dropping orphan tool response before it reaches the wire");
            false
        }
    });

    Ok(OpenAiMessage {
        role,
        content: if text.is_empty() && (!tool_calls.is_empty() || tool_call_id.is_some()) {
            None
        } else {
            Some(text)
        },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id,
    })
}

fn from_openai_response(resp: OpenAiChatResponse) -> Result<Vec<Content>> {
    resp.choices
        .into_iter()
        .map(|choice| {
            let mut blocks = Vec::new();
            if let Some(text) = choice.message.content {
                if !text.is_empty() {
                    blocks.push(Block::Text { text });
                }
            }
            for call in choice.message.tool_calls.unwrap_or_default() {
                blocks.push(Block::ToolCall {
                    id: to_history_id(&call.id),
                    name: call.function.name,
                    parameters: serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::Object(Default::default())),
                });
            }
            Ok(Content::new(Speaker::Ai, blocks))
        })
        .collect()
}

fn create_openai_stream(response: reqwest::Response) -> ContentStream {
    let byte_stream = response.bytes_stream();
    let event_stream = eventsource_stream::EventStream::new(byte_stream);

    let stream = event_stream.scan(ToolCallAccumulator::new(), |accumulator, result| {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                return futures::future::ready(Some(Err(Error::StreamInterrupted {
                    provider: "openai".into(),
                    message: e.to_string(),
                })));
            }
        };

        if event.data == "[DONE]" {
            return futures::future::ready(None);
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_str(&event.data) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "skipping unparsable openai stream chunk");
                return futures::future::ready(Some(Ok(None)));
            }
        };

        if let Some(usage) = chunk.usage {
            let normalized = crate::usage::from_openai_usage(&usage);
            return futures::future::ready(Some(Ok(Some(NeutralStreamEvent::Usage(
                normalized.to_metadata_value(),
            )))));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return futures::future::ready(Some(Ok(None)));
        };

        if choice.finish_reason.is_some() {
            let calls = accumulator.finalize();
            let blocks: Vec<Block> = calls
                .into_iter()
                .map(|c| Block::ToolCall {
                    id: to_history_id(&c.id),
                    name: c.name,
                    parameters: c.args,
                })
                .collect();
            if blocks.is_empty() {
                return futures::future::ready(Some(Ok(None)));
            }
            return futures::future::ready(Some(Ok(Some(NeutralStreamEvent::Content(
                Content::new(Speaker::Ai, blocks),
            )))));
        }

        if let Some(text) = choice.delta.content {
            return futures::future::ready(Some(Ok(Some(NeutralStreamEvent::Content(
                Content::text(Speaker::Ai, text),
            )))));
        }

        if let Some(deltas) = choice.delta.tool_calls {
            for delta in deltas {
                accumulator.push(
                    delta.index,
                    delta.id.as_deref(),
                    delta.function.as_ref().and_then(|f| f.name.as_deref()),
                    delta.function.as_ref().and_then(|f| f.arguments.as_deref()),
                );
            }
        }

        futures::future::ready(Some(Ok(None)))
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
    use llmrelay_core::provider::ToolDefinition;
    use llmrelay_core::settings::{SettingsStore, Streaming};
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn resolved(streaming: Streaming) -> ResolvedCall {
        ResolvedCall {
            model: "gpt-4o".into(),
            base_url: DEFAULT_BASE_URL.into(),
            auth_token: Some("sk-test".into()),
            custom_headers: HashMap::new(),
            request_params: HashMap::new(),
            streaming,
        }
    }

    fn opts(contents: Vec<Content>, tools: Vec<ToolDefinition>) -> ProviderCallOptions {
        ProviderCallOptions {
            provider_name: "openai".into(),
            contents,
            tools,
            settings: SettingsStore::new(Default::default()),
            runtime: llmrelay_core::provider::RuntimeScope::new(),
            invocation: None,
            user_memory: None,
            cancellation: CancellationToken::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn request_omits_content_for_tool_call_only_turn() {
        let history = vec![Content::new(
            Speaker::Ai,
            vec![Block::ToolCall {
                id: "hist_tool_abc".into(),
                name: "search".into(),
                parameters: serde_json::json!({"q": "rust"}),
            }],
        )];
        let o = opts(history.clone(), vec![]);
        let req = to_openai_request(&history, &o, &resolved(Streaming::Enabled)).unwrap();
        assert!(req.messages[0].content.is_none());
        assert_eq!(req.messages[0].tool_calls.as_ref().unwrap()[0].id, "call_abc");
    }

    #[test]
    fn tool_response_translates_call_id_to_wire_form() {
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
        let req = to_openai_request(&history, &o, &resolved(Streaming::Enabled)).unwrap();
        assert_eq!(req.messages[1].tool_call_id.as_deref(), Some("call_abc"));
        assert_eq!(req.messages[1].role, "tool");
    }

    #[test]
    fn orphan_tool_response_is_dropped_without_a_matching_call() {
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
        let req = to_openai_request(&history, &o, &resolved(Streaming::Enabled)).unwrap();
        assert!(req.messages[0].tool_call_id.is_none());
    }

    #[test]
    fn orphan_tool_calls_are_repaired_before_conversion() {
        let history = vec![Content::new(
            Speaker::Ai,
            vec![Block::ToolCall {
                id: "hist_tool_orphan".into(),
                name: "search".into(),
                parameters: serde_json::json!({}),
            }],
        )];
        let repaired = patch_orphan_tool_calls(&history);
        assert_eq!(repaired.len(), 2);
        assert!(repaired[1].is_synthetic());
    }

    #[test]
    fn from_response_decodes_tool_calls_back_to_history_ids() {
        let resp = OpenAiChatResponse {
            choices: vec![OpenAiChoice {
                message: OpenAiMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: Some(vec![OpenAiToolCall {
                        id: "call_abc".into(),
                        tool_type: "function".into(),
                        function: OpenAiFunctionCall {
                            name: "search".into(),
                            arguments: "{\"q\":\"rust\"}".into(),
                        },
                    }]),
                    tool_call_id: None,
                },
            }],
            usage: None,
        };
        let contents = from_openai_response(resp).unwrap();
        match &contents[0].blocks[0] {
            Block::ToolCall { id, .. } => assert_eq!(id, "hist_tool_abc"),
            _ => panic!("expected tool call"),
        }
    }
}
