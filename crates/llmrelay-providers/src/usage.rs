//! Usage-record normalization (spec.md §4.F point 6): every adapter's raw,
//! provider-specific usage object is translated into one neutral shape
//! before it reaches `NeutralStreamEvent::Usage`.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizedUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_miss_tokens: u64,
}

impl NormalizedUsage {
    pub fn to_metadata_value(self) -> Value {
        json!({
            "promptTokens": self.prompt_tokens,
            "completionTokens": self.completion_tokens,
            "totalTokens": self.total_tokens,
            "cachedTokens": self.cached_tokens,
            "cacheCreationTokens": self.cache_creation_tokens,
            "cacheMissTokens": self.cache_miss_tokens,
        })
    }
}

fn u64_at(value: &Value, path: &[&str]) -> u64 {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// OpenAI Chat Completions / Responses usage object:
/// `{prompt_tokens, completion_tokens, total_tokens,
///   prompt_tokens_details: {cached_tokens}}`. Deepseek-flavored upstreams
/// speaking the same wire form instead send
/// `prompt_cache_hit_tokens`/`prompt_cache_miss_tokens` at the top level.
pub fn from_openai_usage(raw: &Value) -> NormalizedUsage {
    let prompt_tokens = u64_at(raw, &["prompt_tokens"]);
    let completion_tokens = u64_at(raw, &["completion_tokens"]);
    let total_tokens = u64_at(raw, &["total_tokens"]);
    let cached_from_details = u64_at(raw, &["prompt_tokens_details", "cached_tokens"]);
    let cached_from_deepseek = u64_at(raw, &["prompt_cache_hit_tokens"]);
    let cache_miss_tokens = u64_at(raw, &["prompt_cache_miss_tokens"]);

    NormalizedUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cached_tokens: cached_from_details.max(cached_from_deepseek),
        cache_creation_tokens: 0,
        cache_miss_tokens,
    }
}

/// Anthropic usage object: `{input_tokens, output_tokens,
/// cache_read_input_tokens?, cache_creation_input_tokens?}`.
pub fn from_anthropic_usage(raw: &Value) -> NormalizedUsage {
    let prompt_tokens = u64_at(raw, &["input_tokens"]);
    let completion_tokens = u64_at(raw, &["output_tokens"]);
    NormalizedUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        cached_tokens: u64_at(raw, &["cache_read_input_tokens"]),
        cache_creation_tokens: u64_at(raw, &["cache_creation_input_tokens"]),
        cache_miss_tokens: 0,
    }
}

/// Gemini `usageMetadata` object: `{promptTokenCount, candidatesTokenCount,
/// totalTokenCount, cachedContentTokenCount?}`.
pub fn from_gemini_usage(raw: &Value) -> NormalizedUsage {
    NormalizedUsage {
        prompt_tokens: u64_at(raw, &["promptTokenCount"]),
        completion_tokens: u64_at(raw, &["candidatesTokenCount"]),
        total_tokens: u64_at(raw, &["totalTokenCount"]),
        cached_tokens: u64_at(raw, &["cachedContentTokenCount"]),
        cache_creation_tokens: 0,
        cache_miss_tokens: 0,
    }
}
