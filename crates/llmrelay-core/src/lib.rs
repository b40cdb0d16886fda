//! Core, provider-agnostic types and logic for the llmrelay client runtime:
//! the settings stack, tool-call id utilities, synthetic repair, the
//! streaming tool-call pipeline, and the neutral call orchestrator.

pub mod content;
pub mod error;
pub mod orchestrator;
pub mod profile;
pub mod provider;
pub mod repair;
pub mod settings;
pub mod tool_ids;
pub mod tool_stream;

pub use content::{Block, Content, MediaEncoding, Speaker};
pub use error::{ConfigurationError, Error, Result};
pub use orchestrator::{Orchestrator, ProviderDefaults};
pub use profile::{resolve_profile_source, Profile, ProfileSource};
pub use provider::{
    ContentStream, InvocationOverrides, ModelInfo, NeutralStreamEvent, Provider,
    ProviderCallOptions, ProviderCapabilities, ResolvedCall, RuntimeScope, SharedProvider,
    ToolDefinition, ToolFormat,
};
pub use repair::patch_orphan_tool_calls;
pub use settings::{CallScopedSettings, SettingValue, SettingsMap, SettingsStore, Streaming};
pub use tool_ids::{to_anthropic_id, to_history_id, to_openai_id};
pub use tool_stream::{NormalizedToolCall, ToolCallAccumulator, ToolNameValidation, validate_tool_name};
