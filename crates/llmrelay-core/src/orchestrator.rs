//! Neutral call orchestrator (§4.G) — the "BaseProvider" every adapter sits
//! behind. Stateless: holds no call-specific fields, so the same instance is
//! safe to share across concurrent calls to different providers (§8.5).

use std::collections::HashMap;

use serde_json::Value;
use tracing::instrument;

use crate::error::{ConfigurationError, Error, Result};
use crate::provider::{call_scoped_settings, ProviderCallOptions, ResolvedCall};
use crate::settings::{streaming_from_setting, SettingValue, SettingsStore};

/// Static facts about a provider family that the settings stack alone
/// cannot supply — the adapter's own compiled-in defaults.
#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    pub default_model: String,
    pub default_base_url: String,
}

/// Stateless resolver. Construction takes no provider-specific state; every
/// method is a pure function of its arguments plus the shared settings
/// store, which is itself the only thing that may carry cross-call state
/// (and even that is append-only from the orchestrator's point of view).
#[derive(Debug, Default, Clone, Copy)]
pub struct Orchestrator;

impl Orchestrator {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip(self, opts, defaults), fields(provider = %opts.provider_name))]
    pub async fn resolve(
        &self,
        opts: &ProviderCallOptions,
        defaults: &ProviderDefaults,
    ) -> Result<ResolvedCall> {
        let provider = opts.provider_name.as_str();
        let base = opts.settings.get_provider_settings(provider).await;
        let overlay = call_scoped_settings(base, opts.invocation.as_ref());

        let model = overlay
            .get("model")
            .and_then(SettingValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| defaults.default_model.clone());

        let base_url = self.get_base_url(opts, defaults).await?;
        let auth_token = self.get_auth_token(opts).await?;
        let custom_headers = self.get_custom_headers(opts).await;
        let request_params = self.get_model_params(opts).await;
        let streaming = overlay.streaming();

        Ok(ResolvedCall {
            model,
            base_url,
            auth_token,
            custom_headers,
            request_params,
            streaming,
        })
    }

    /// `auth-key` wins outright; `auth-keyfile` is read (with `~` expansion)
    /// only when no `auth-key` is set. A keyfile that can't be read is a
    /// hard `ConfigurationError`, not a silent fall-through to unauthenticated.
    pub async fn get_auth_token(&self, opts: &ProviderCallOptions) -> Result<Option<String>> {
        let provider = opts.provider_name.as_str();

        if let Some(key) = opts
            .settings
            .get_for_provider(provider, "auth-key")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
        {
            return Ok(Some(key));
        }

        let Some(keyfile) = opts
            .settings
            .get_for_provider(provider, "auth-keyfile")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
        else {
            return Ok(None);
        };

        let path = expand_tilde(&keyfile);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ConfigurationError::KeyfileUnreadable(format!("{path}: {e}")))?;
        Ok(Some(contents.trim().to_string()))
    }

    /// Per-provider `base-url` beats the global one; the global session
    /// `base-url` only applies while this provider is the active one, so a
    /// global override set while using Anthropic never leaks into an
    /// OpenAI call made later in the same process.
    pub async fn get_base_url(
        &self,
        opts: &ProviderCallOptions,
        defaults: &ProviderDefaults,
    ) -> Result<String> {
        let provider = opts.provider_name.as_str();

        if let Some(overlay_url) = opts
            .invocation
            .as_ref()
            .and_then(|inv| inv.ephemerals.get("base-url"))
            .and_then(SettingValue::as_str)
        {
            return Ok(overlay_url.to_string());
        }

        let provider_settings = opts.settings.get_provider_settings(provider).await;
        if let Some(url) = provider_settings.get("base-url").and_then(SettingValue::as_str) {
            return Ok(url.to_string());
        }

        let active = opts.settings.active_provider().await;
        if active.as_deref() == Some(provider) {
            if let Some(url) = opts
                .settings
                .get("base-url")
                .await
                .and_then(|v| v.as_str().map(str::to_string))
            {
                return Ok(url);
            }
        }

        Ok(defaults.default_base_url.clone())
    }

    pub async fn get_custom_headers(&self, opts: &ProviderCallOptions) -> HashMap<String, String> {
        let provider = opts.provider_name.as_str();
        let provider_settings = opts.settings.get_provider_settings(provider).await;
        match provider_settings.get("custom-headers") {
            Some(SettingValue::Map(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => HashMap::new(),
        }
    }

    /// `modelParams` from the provider layer, overlaid by any call-scoped
    /// invocation params under the same key.
    pub async fn get_model_params(&self, opts: &ProviderCallOptions) -> HashMap<String, Value> {
        let provider = opts.provider_name.as_str();
        let mut params: HashMap<String, Value> = opts
            .settings
            .get_provider_settings(provider)
            .await
            .into_iter()
            .filter_map(|(k, v)| setting_to_json(&v).map(|json| (k, json)))
            .collect();

        if let Some(invocation) = &opts.invocation {
            for (k, v) in &invocation.ephemerals {
                if let Some(json) = setting_to_json(v) {
                    params.insert(k.clone(), json);
                }
            }
        }
        params
    }
}

fn setting_to_json(value: &SettingValue) -> Option<Value> {
    match value {
        SettingValue::String(s) => Some(Value::String(s.clone())),
        SettingValue::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number),
        SettingValue::Bool(b) => Some(Value::Bool(*b)),
        SettingValue::Map(map) => Some(Value::Object(map.clone().into_iter().collect())),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Streaming override resolution, split out for the one spot
/// ([`crate::settings::CallScopedSettings::streaming`]) that needs it
/// outside of a full `resolve()` call.
pub fn streaming_override(opts: &ProviderCallOptions) -> crate::settings::Streaming {
    let ephemeral = opts
        .invocation
        .as_ref()
        .and_then(|inv| inv.ephemerals.get("streaming"));
    streaming_from_setting(ephemeral)
}
