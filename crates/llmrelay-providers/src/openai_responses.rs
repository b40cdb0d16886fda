//! OpenAI Responses adapter: the flat `input[]` wire form, plus Codex-mode
//! rewriting when the resolved base URL points at
//! `chatgpt.com/backend-api/codex` (spec.md §4.F point 3, scenario (d)).
//!
//! Grounded on the egress connector's `OpenAIConnector` for the
//! auth-fallback and header-passthrough shape, generalized from its single
//! Chat Completions endpoint onto the separate Responses wire form.

use std::path::PathBuf;
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
use llmrelay_core::tool_ids::{to_history_id, to_openai_id};
use llmrelay_retry::{BucketFailover, NoFailover, RetryOptions};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::codex_auth::read_codex_token;
use crate::common::{apply_auth_and_headers, retrying_stream, send_with_retry, TransportError};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CODEX_BASE_URL_MARKER: &str = "chatgpt.com/backend-api/codex";
const CODEX_TOKEN_FIELD: &str = "tokens.access_token";
const CODEX_ACCOUNT_FIELD: &str = "tokens.account_id";

pub struct OpenAiResponsesProvider {
    client: Client,
    codex_auth_file: PathBuf,
    retry_opts: RetryOptions,
    failover: Arc<dyn BucketFailover>,
}

impl OpenAiResponsesProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            codex_auth_file: PathBuf::from("~/.codex/auth.json"),
            retry_opts: RetryOptions::default(),
            failover: Arc::new(NoFailover),
        }
    }

    pub fn with_codex_auth_file(mut self, path: PathBuf) -> Self {
        self.codex_auth_file = path;
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

    fn is_codex_mode(resolved: &ResolvedCall) -> bool {
        resolved.base_url.contains(CODEX_BASE_URL_MARKER)
    }
}

#[async_trait]
impl Provider for OpenAiResponsesProvider {
    fn name(&self) -> &str {
        "openai-responses"
    }

    #[instrument(skip(self, options, resolved), fields(provider = "openai-responses"))]
    async fn generate(&self, options: ProviderCallOptions, resolved: ResolvedCall) -> Result<ContentStream> {
        let repaired = patch_orphan_tool_calls(&options.contents);
        let codex_mode = Self::is_codex_mode(&resolved);
        let request = to_responses_request(&repaired, &options, &resolved, codex_mode)?;
        let codex_account_id = if codex_mode { self.codex_account_id(&resolved).await } else { None };
        let streaming_disabled = matches!(resolved.streaming, Streaming::Disabled);

        let url = format!("{}/responses", resolved.base_url.trim_end_matches('/'));
        let client = self.client.clone();
        let retry_opts = self.retry_opts;
        let failover = self.failover.clone();

        let build_request = move || {
            let mut builder = apply_auth_and_headers(client.post(&url).json(&request), &resolved, "Authorization");
            if codex_mode {
                builder = builder.header("originator", "codex_cli_rs");
                if let Some(account_id) = &codex_account_id {
                    builder = builder.header("ChatGPT-Account-ID", account_id.clone());
                }
            }
            builder
        };

        if streaming_disabled {
            let response = send_with_retry("openai-responses", retry_opts, failover.as_ref(), build_request).await?;
            let body: ResponsesResponse = response
                .json()
                .await
                .map_err(TransportError::Http)
                .map_err(|e| e.into_core_error("openai-responses"))?;
            let usage = body.usage.clone();
            let content = from_responses_response(body)?;
            let mut events = vec![Ok::<NeutralStreamEvent, Error>(NeutralStreamEvent::Content(content))];
            if let Some(usage) = usage {
                let normalized = normalize_responses_usage(&usage);
                events.push(Ok(NeutralStreamEvent::Usage(normalized.to_metadata_value())));
            }
            let stream = futures::stream::iter(events);
            return Ok(Box::pin(stream) as ContentStream);
        }

        Ok(retrying_stream(retry_opts, move || {
            let build_request = build_request.clone();
            let failover = failover.clone();
            async move {
                let response = send_with_retry("openai-responses", retry_opts, failover.as_ref(), build_request).await?;
                Ok(create_responses_stream(response))
            }
        }))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: DEFAULT_MODEL.into(),
            display_name: Some("GPT-4o mini (Responses)".into()),
        }])
    }

    fn get_default_model(&self) -> String {
        DEFAULT_MODEL.to_string()
    }

    fn get_tool_format(&self) -> ToolFormat {
        ToolFormat::OpenAi
    }

    fn supports_oauth(&self) -> bool {
        true
    }

    async fn is_authenticated(&self, resolved: &ResolvedCall) -> bool {
        if Self::is_codex_mode(resolved) {
            self.codex_account_token().await.is_some() || resolved.auth_token.as_ref().is_some_and(|t| !t.is_empty())
        } else {
            resolved.auth_token.as_ref().is_some_and(|t| !t.is_empty())
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_vision: true,
        }
    }
}

impl OpenAiResponsesProvider {
    async fn codex_account_token(&self) -> Option<String> {
        match read_codex_token(&self.codex_auth_file, CODEX_TOKEN_FIELD).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "failed to read codex access token");
                None
            }
        }
    }

    async fn codex_account_id(&self, resolved: &ResolvedCall) -> Option<String> {
        if let Some(header_id) = resolved.custom_headers.get("ChatGPT-Account-ID") {
            return Some(header_id.clone());
        }
        match read_codex_token(&self.codex_auth_file, CODEX_ACCOUNT_FIELD).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "failed to read codex account id");
                None
            }
        }
    }
}

// Wire types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesItem {
    Message { role: String, content: String },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Debug, Clone, Serialize)]
struct ResponsesTool {
    #[serde(rename = "type")]
    tool_type: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<ResponsesItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    store: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ResponsesTool>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<ResponsesOutputItem>,
    #[serde(default)]
    usage: Option<Value>,
}

/// The Responses API names usage fields `input_tokens`/`output_tokens`
/// rather than Chat Completions' `prompt_tokens`/`completion_tokens`.
fn normalize_responses_usage(raw: &Value) -> crate::usage::NormalizedUsage {
    crate::usage::NormalizedUsage {
        prompt_tokens: raw.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: raw.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        total_tokens: raw.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
        cached_tokens: raw
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_creation_tokens: 0,
        cache_miss_tokens: 0,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesOutputItem {
    Message {
        #[serde(default)]
        content: Vec<ResponsesOutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesOutputContent {
    OutputText { text: String },
    #[serde(other)]
    Unknown,
}

fn to_responses_request(
    history: &[Content],
    options: &ProviderCallOptions,
    resolved: &ResolvedCall,
    codex_mode: bool,
) -> Result<ResponsesRequest> {
    let known_call_ids: std::collections::HashSet<String> = history
        .iter()
        .flat_map(|c| c.tool_calls().map(|(id, _, _)| to_openai_id(id)))
        .collect();

    let mut instructions = None;
    let mut input = Vec::new();

    for content in history {
        if codex_mode && content.speaker == Speaker::System {
            // Codex mode: the system prompt moves to top-level
            // `instructions` and is never emitted as an `input[]` item.
            instructions = Some(content.text_content());
            continue;
        }

        for (id, name, params) in content.tool_calls() {
            input.push(ResponsesItem::FunctionCall {
                call_id: to_openai_id(id),
                name: name.to_string(),
                arguments: params.to_string(),
            });
        }
        for call_id in content.tool_responses() {
            let wire_id = to_openai_id(call_id);
            if !known_call_ids.contains(&wire_id) {
                let err = Error::ToolHistory(format!("no matching function call for response id {wire_id}"));
                warn!(%err, call_id = %wire_id, "dropping orphan function_call_output before it reaches the wire");
                continue;
            }
            let output = content
                .blocks
                .iter()
                .find_map(|b| match b {
                    Block::ToolResponse { call_id: cid, result, .. } if cid == call_id => {
                        Some(result.to_string())
                    }
                    _ => None,
                })
                .unwrap_or_default();
            input.push(ResponsesItem::FunctionCallOutput {
                call_id: wire_id,
                output,
            });
        }

        let text = content.text_content();
        if !text.is_empty() {
            let role = match content.speaker {
                Speaker::Human => "user",
                Speaker::Ai => "assistant",
                Speaker::System => "system",
                Speaker::Tool => continue,
            }
            .to_string();
            input.push(ResponsesItem::Message { role, content: text });
        }
    }

    let tools = if options.tools.is_empty() {
        None
    } else {
        Some(
            options
                .tools
                .iter()
                .map(|t| ResponsesTool {
                    tool_type: "function".into(),
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        )
    };

    let max_output_tokens = if codex_mode {
        None
    } else {
        resolved
            .request_params
            .get("max_output_tokens")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
    };

    Ok(ResponsesRequest {
        model: resolved.model.clone(),
        input,
        instructions,
        store: if codex_mode { Some(false) } else { None },
        max_output_tokens,
        stream: matches!(resolved.streaming, Streaming::Enabled),
        tools,
    })
}

fn from_responses_response(resp: ResponsesResponse) -> Result<Content> {
    let mut blocks = Vec::new();
    for item in resp.output {
        match item {
            ResponsesOutputItem::Message { content } => {
                for c in content {
                    if let ResponsesOutputContent::OutputText { text } = c {
                        blocks.push(Block::Text { text });
                    }
                }
            }
            ResponsesOutputItem::FunctionCall { call_id, name, arguments } => {
                blocks.push(Block::ToolCall {
                    id: to_history_id(&call_id),
                    name,
                    parameters: serde_json::from_str(&arguments)
                        .unwrap_or(Value::Object(Default::default())),
                });
            }
            ResponsesOutputItem::Unknown => {}
        }
    }
    Ok(Content::new(Speaker::Ai, blocks))
}

fn create_responses_stream(response: reqwest::Response) -> ContentStream {
    let byte_stream = response.bytes_stream();
    let event_stream = eventsource_stream::EventStream::new(byte_stream);

    let stream = event_stream.filter_map(|result| async move {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                return Some(Err(Error::StreamInterrupted {
                    provider: "openai-responses".into(),
                    message: e.to_string(),
                }));
            }
        };

        let payload: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unparsable responses stream event");
                return None;
            }
        };

        match payload.get("type").and_then(Value::as_str) {
            Some("response.output_text.delta") => {
                let text = payload.get("delta").and_then(Value::as_str)?.to_string();
                Some(Ok(NeutralStreamEvent::Content(Content::text(Speaker::Ai, text))))
            }
            Some("response.output_item.done") => {
                let item = payload.get("item")?;
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return None;
                }
                let call_id = item.get("call_id").and_then(Value::as_str)?.to_string();
                let name = item.get("name").and_then(Value::as_str)?.to_string();
                let arguments = item.get("arguments").and_then(Value::as_str).unwrap_or("{}");
                Some(Ok(NeutralStreamEvent::Content(Content::new(
                    Speaker::Ai,
                    vec![Block::ToolCall {
                        id: to_history_id(&call_id),
                        name,
                        parameters: serde_json::from_str(arguments)
                            .unwrap_or(Value::Object(Default::default())),
                    }],
                ))))
            }
            Some("response.completed") => {
                let usage = payload.get("response").and_then(|r| r.get("usage"))?;
                let normalized = normalize_responses_usage(usage);
                Some(Ok(NeutralStreamEvent::Usage(normalized.to_metadata_value())))
            }
            _ => None,
        }
    });

    Box::pin(stream) as Pin<Box<dyn Stream<Item = Result<NeutralStreamEvent>> + Send>>
}
