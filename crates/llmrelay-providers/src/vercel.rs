//! Vercel AI Gateway adapter.
//!
//! The gateway speaks the OpenAI Chat Completions wire format verbatim
//! (model ids are namespaced, e.g. `openai/gpt-4o-mini`); the only
//! differences from a direct OpenAI call are the default base URL and
//! the provider name used for settings/error attribution. Modeled as a
//! thin preset over [`OpenAiChatProvider`] rather than a new wire format —
//! see the Open Question resolution recorded in `DESIGN.md`.

use async_trait::async_trait;
use llmrelay_core::error::Result;
use llmrelay_core::provider::{
    ContentStream, ModelInfo, Provider, ProviderCallOptions, ProviderCapabilities, ResolvedCall,
    ToolFormat,
};
use reqwest::Client;

use crate::openai_chat::OpenAiChatProvider;

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://ai-gateway.vercel.sh/v1";

pub struct VercelGatewayProvider {
    inner: OpenAiChatProvider,
}

impl VercelGatewayProvider {
    pub fn new(client: Client) -> Self {
        Self {
            inner: OpenAiChatProvider::new(client),
        }
    }
}

#[async_trait]
impl Provider for VercelGatewayProvider {
    fn name(&self) -> &str {
        "vercel"
    }

    async fn generate(&self, options: ProviderCallOptions, resolved: ResolvedCall) -> Result<ContentStream> {
        self.inner.generate(options, resolved).await
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![
            ModelInfo { id: "openai/gpt-4o-mini".into(), display_name: Some("GPT-4o mini (via Vercel)".into()) },
            ModelInfo { id: "anthropic/claude-3-5-sonnet".into(), display_name: Some("Claude 3.5 Sonnet (via Vercel)".into()) },
        ])
    }

    fn get_default_model(&self) -> String {
        DEFAULT_MODEL.to_string()
    }

    fn get_tool_format(&self) -> ToolFormat {
        ToolFormat::OpenAi
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.inner.capabilities()
    }
}
