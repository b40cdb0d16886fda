//! Provider adapters (§4.F): each submodule translates the neutral call
//! contract in `llmrelay_core::provider` to and from one wire protocol.

pub mod anthropic;
pub mod common;
pub mod codex_auth;
pub mod gemini;
pub mod openai_chat;
pub mod openai_responses;
pub mod usage;
pub mod vercel;

pub use anthropic::AnthropicProvider;
pub use common::{
    apply_auth_and_headers, create_client, merged_request_params, HttpClientConfig,
    TransportError, TransportResult,
};
pub use gemini::GeminiProvider;
pub use openai_chat::OpenAiChatProvider;
pub use openai_responses::OpenAiResponsesProvider;
pub use usage::NormalizedUsage;
pub use vercel::VercelGatewayProvider;
