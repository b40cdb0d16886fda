//! The neutral call contract (§3, §6) and the per-provider `Provider` trait
//! (§4.F).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::content::Content;
use crate::error::Result;
use crate::settings::{CallScopedSettings, SettingsStore};

static RUNTIME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An opaque per-invocation scope carrying a unique `runtime_id`, used to
/// isolate concurrent calls (e.g. Gemini's OAuth code-assist session id
/// embeds this so two runtimes never share a server session).
#[derive(Debug, Clone)]
pub struct RuntimeScope {
    pub runtime_id: String,
}

impl RuntimeScope {
    /// Mint a fresh, process-unique runtime id. Not a UUID — grounded in
    /// the teacher's own id-minting style (`prefix-counter-timestamp`)
    /// rather than pulling in a `uuid` dependency this crate doesn't
    /// otherwise need.
    pub fn new() -> Self {
        let n = RUNTIME_COUNTER.fetch_add(1, Ordering::Relaxed);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self {
            runtime_id: format!("rt-{now:x}-{n}"),
        }
    }
}

impl Default for RuntimeScope {
    fn default() -> Self {
        Self::new()
    }
}

/// A tool definition available to the model, in neutral form.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub parameters: Value,
}

/// Per-call ephemeral overrides, scoped to a single invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationOverrides {
    pub ephemerals: HashMap<String, crate::settings::SettingValue>,
    pub user_memory: Option<String>,
}

/// Input to the orchestrator (§3, §6): immutable for the duration of one
/// call.
#[derive(Clone)]
pub struct ProviderCallOptions {
    pub provider_name: String,
    pub contents: Vec<Content>,
    pub tools: Vec<ToolDefinition>,
    pub settings: SettingsStore,
    pub runtime: RuntimeScope,
    pub invocation: Option<InvocationOverrides>,
    pub user_memory: Option<String>,
    pub cancellation: CancellationToken,
    pub metadata: HashMap<String, Value>,
}

/// Derived, call-lifetime-only resolved parameters (§3). Never stored on
/// the provider instance.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub model: String,
    pub base_url: String,
    pub auth_token: Option<String>,
    pub custom_headers: HashMap<String, String>,
    pub request_params: HashMap<String, Value>,
    pub streaming: crate::settings::Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFormat {
    OpenAi,
    Anthropic,
    Gemini,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_vision: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NeutralStreamEvent {
    Content(Content),
    /// Carries the final usage summary; at most one per call (§6).
    Usage(Value),
}

pub type ContentStream = std::pin::Pin<Box<dyn Stream<Item = Result<NeutralStreamEvent>> + Send>>;

/// Per-provider adapter surface (§4.F). Implementors must hold no
/// call-specific mutable state: only configuration defaults (name, OAuth
/// descriptors) may live on `&self`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, options: ProviderCallOptions, resolved: ResolvedCall) -> Result<ContentStream>;

    async fn get_models(&self) -> Result<Vec<ModelInfo>>;

    fn get_default_model(&self) -> String;

    fn get_tool_format(&self) -> ToolFormat;

    fn supports_oauth(&self) -> bool {
        false
    }

    async fn is_authenticated(&self, resolved: &ResolvedCall) -> bool {
        resolved.auth_token.as_ref().is_some_and(|t| !t.is_empty())
    }

    fn capabilities(&self) -> ProviderCapabilities;
}

pub fn call_scoped_settings(
    base: crate::settings::SettingsMap,
    invocation: Option<&InvocationOverrides>,
) -> CallScopedSettings {
    let overlay = invocation
        .map(|inv| inv.ephemerals.clone())
        .unwrap_or_default();
    CallScopedSettings::new(base, overlay)
}

pub type SharedProvider = Arc<dyn Provider>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_scopes_are_unique() {
        let a = RuntimeScope::new();
        let b = RuntimeScope::new();
        assert_ne!(a.runtime_id, b.runtime_id);
    }
}
