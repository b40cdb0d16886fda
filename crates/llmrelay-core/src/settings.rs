//! Layered settings stack (§4.A).
//!
//! Precedence, lowest to highest: built-in defaults, user profile,
//! environment variables, per-provider settings, process-wide session
//! settings, invocation ephemerals, explicit per-call overrides. The last
//! two layers are never stored on the shared store — they exist only as a
//! call-scoped overlay constructed by the orchestrator (§4.G).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{ConfigurationError, Result};
use crate::profile::Profile;

/// A single recognized or opaque ephemeral setting value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    String(String),
    Number(f64),
    Bool(bool),
    Map(HashMap<String, Value>),
}

impl SettingValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        SettingValue::String(s.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(s: String) -> Self {
        SettingValue::String(s)
    }
}

impl From<bool> for SettingValue {
    fn from(b: bool) -> Self {
        SettingValue::Bool(b)
    }
}

pub type SettingsMap = HashMap<String, SettingValue>;

#[derive(Debug, Default, Clone)]
struct Layers {
    defaults: SettingsMap,
    profile: SettingsMap,
    env: SettingsMap,
    provider: HashMap<String, SettingsMap>,
    session: SettingsMap,
}

/// Three-valued streaming setting, as spec.md §4.A describes: only an
/// explicit `"disabled"` turns streaming off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Streaming {
    Enabled,
    Disabled,
}

pub fn streaming_from_setting(value: Option<&SettingValue>) -> Streaming {
    match value.and_then(SettingValue::as_str) {
        Some("disabled") => Streaming::Disabled,
        _ => Streaming::Enabled,
    }
}

/// Shared, concurrently-readable settings store. Readers take a read lock;
/// `set`/`set_provider_setting`/`apply_profile` take a write lock.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    layers: Arc<RwLock<Layers>>,
    active_provider: Arc<RwLock<Option<String>>>,
}

impl SettingsStore {
    /// Construct a store seeded with `defaults` and the env layer read from
    /// the current process's environment (§4.A). This is the only
    /// constructor — every store the runtime hands out already reflects
    /// `LLXPRT_PROFILE`/`LLXPRT_NO_BROWSER_AUTH`/`CI`/`HOME` at the moment
    /// of construction, so behavior stays deterministic within a process
    /// lifetime rather than drifting if the environment changes mid-run.
    pub fn new(defaults: SettingsMap) -> Self {
        Self {
            layers: Arc::new(RwLock::new(Layers {
                defaults,
                env: env_layer_from_process(),
                ..Default::default()
            })),
            active_provider: Arc::new(RwLock::new(None)),
        }
    }

    /// Alias for [`SettingsStore::new`], kept for call sites that want to
    /// make the env-reading behavior explicit at the call site.
    pub fn from_env(defaults: SettingsMap) -> Self {
        Self::new(defaults)
    }

    pub async fn set_active_provider(&self, provider: impl Into<String>) {
        *self.active_provider.write().await = Some(provider.into());
    }

    pub async fn active_provider(&self) -> Option<String> {
        self.active_provider.read().await.clone()
    }

    /// Session-scoped lookup only — does not consult any provider layer.
    /// Most callers want [`SettingsStore::get_for_provider`], which scopes
    /// the provider layer to the currently active provider instead of
    /// scanning every provider's settings.
    pub async fn get(&self, key: &str) -> Option<SettingValue> {
        let layers = self.layers.read().await;
        layers
            .session
            .get(key)
            .or_else(|| layers.env.get(key))
            .or_else(|| layers.profile.get(key))
            .or_else(|| layers.defaults.get(key))
            .cloned()
    }

    /// Full six-layer lookup, with the provider layer scoped to `provider`
    /// — a setting saved under a *different* provider's scope must never
    /// leak into this lookup (e.g. a global `base-url` only applies when
    /// `provider == active_provider`, never to every provider at once).
    pub async fn get_for_provider(&self, provider: &str, key: &str) -> Option<SettingValue> {
        let layers = self.layers.read().await;
        layers
            .session
            .get(key)
            .or_else(|| layers.provider.get(provider).and_then(|m| m.get(key)))
            .or_else(|| layers.env.get(key))
            .or_else(|| layers.profile.get(key))
            .or_else(|| layers.defaults.get(key))
            .cloned()
    }

    pub async fn get_provider_settings(&self, provider: &str) -> SettingsMap {
        let layers = self.layers.read().await;
        layers.provider.get(provider).cloned().unwrap_or_default()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<SettingValue>) {
        let mut layers = self.layers.write().await;
        layers.session.insert(key.into(), value.into());
    }

    pub async fn set_provider_setting(
        &self,
        provider: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<SettingValue>,
    ) {
        let mut layers = self.layers.write().await;
        layers
            .provider
            .entry(provider.into())
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Returns a **defensive copy**: mutating the returned map never
    /// affects a future call to this method (testable property §8.6).
    pub async fn get_ephemeral_settings(&self) -> SettingsMap {
        let layers = self.layers.read().await;
        layers.session.clone()
    }

    /// Apply a validated `Profile`: `modelParams` land in the provider
    /// scope, `ephemeralSettings` land in the session scope.
    pub async fn apply_profile(&self, profile: &Profile) -> Result<()> {
        profile.validate()?;
        let mut layers = self.layers.write().await;
        for (k, v) in &profile.model_params {
            layers
                .provider
                .entry(profile.provider.clone())
                .or_default()
                .insert(k.clone(), json_value_to_setting(v));
        }
        for (k, v) in &profile.ephemeral_settings {
            layers.session.insert(k.clone(), json_value_to_setting(v));
        }
        layers.profile.insert("provider".into(), profile.provider.clone().into());
        layers.profile.insert("model".into(), profile.model.clone().into());
        Ok(())
    }
}

/// Recognized environment variables for the env layer (§4.A). `CI` and
/// `LLXPRT_NO_BROWSER_AUTH` are treated as booleans: any non-empty value
/// other than `"0"`/`"false"` counts as set.
fn env_layer_from_process() -> SettingsMap {
    let mut env = SettingsMap::new();

    if let Ok(profile) = std::env::var("LLXPRT_PROFILE") {
        env.insert("profile".into(), SettingValue::String(profile));
    }
    if let Some(flag) = env_bool("LLXPRT_NO_BROWSER_AUTH") {
        env.insert("no-browser-auth".into(), SettingValue::Bool(flag));
    }
    if let Some(flag) = env_bool("CI") {
        env.insert("ci".into(), SettingValue::Bool(flag));
    }
    if let Ok(home) = std::env::var("HOME") {
        env.insert("home".into(), SettingValue::String(home));
    }

    env
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|raw| !raw.is_empty() && raw != "0" && !raw.eq_ignore_ascii_case("false"))
}

fn json_value_to_setting(value: &Value) -> SettingValue {
    match value {
        Value::String(s) => SettingValue::String(s.clone()),
        Value::Number(n) => SettingValue::Number(n.as_f64().unwrap_or_default()),
        Value::Bool(b) => SettingValue::Bool(*b),
        Value::Object(map) => SettingValue::Map(map.clone().into_iter().collect()),
        other => SettingValue::String(other.to_string()),
    }
}

/// A frozen, per-call overlay: invocation ephemerals layered over the
/// shared store's current view. The orchestrator constructs one of these
/// per call and hands it to the adapter; adapters must never read the
/// shared store directly mid-call (§4.G statelessness guarantee).
#[derive(Debug, Clone)]
pub struct CallScopedSettings {
    base: SettingsMap,
    overlay: SettingsMap,
}

impl CallScopedSettings {
    pub fn new(base: SettingsMap, overlay: SettingsMap) -> Self {
        Self { base, overlay }
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.overlay.get(key).or_else(|| self.base.get(key))
    }

    pub fn streaming(&self) -> Streaming {
        streaming_from_setting(self.get("streaming"))
    }
}

pub fn validate_streaming_value(raw: &str) -> std::result::Result<(), ConfigurationError> {
    match raw {
        "disabled" | "enabled" => Ok(()),
        other => Err(ConfigurationError::InvalidStreamingValue(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn precedence_session_beats_provider_beats_env_beats_profile_beats_defaults() {
        let mut defaults = SettingsMap::new();
        defaults.insert("model".into(), "default-model".into());
        let store = SettingsStore::new(defaults);

        assert_eq!(store.get("model").await.unwrap().as_str(), Some("default-model"));

        store.set_provider_setting("openai", "model", "provider-model").await;
        assert_eq!(store.get("model").await.unwrap().as_str(), Some("provider-model"));

        store.set("model", "session-model").await;
        assert_eq!(store.get("model").await.unwrap().as_str(), Some("session-model"));
    }

    #[tokio::test]
    async fn ephemeral_settings_returns_defensive_copy() {
        let store = SettingsStore::new(SettingsMap::new());
        store.set("auth-key", "secret").await;

        let mut copy = store.get_ephemeral_settings().await;
        copy.insert("auth-key".into(), "tampered".into());

        let fresh = store.get_ephemeral_settings().await;
        assert_eq!(fresh.get("auth-key").unwrap().as_str(), Some("secret"));
    }

    #[test]
    fn streaming_is_three_valued() {
        assert_eq!(streaming_from_setting(None), Streaming::Enabled);
        assert_eq!(
            streaming_from_setting(Some(&"enabled".into())),
            Streaming::Enabled
        );
        assert_eq!(
            streaming_from_setting(Some(&"disabled".into())),
            Streaming::Disabled
        );
    }

    #[tokio::test]
    async fn provider_scoped_lookup_never_leaks_across_providers() {
        let store = SettingsStore::new(SettingsMap::new());
        store.set_provider_setting("anthropic", "base-url", "https://anthropic.example").await;

        assert_eq!(store.get_for_provider("openai", "base-url").await, None);
        assert_eq!(
            store
                .get_for_provider("anthropic", "base-url")
                .await
                .unwrap()
                .as_str(),
            Some("https://anthropic.example")
        );
    }

    #[test]
    fn env_bool_treats_unset_empty_and_false_as_unset() {
        std::env::remove_var("LLMRELAY_TEST_FLAG_UNSET");
        assert_eq!(env_bool("LLMRELAY_TEST_FLAG_UNSET"), None);

        std::env::set_var("LLMRELAY_TEST_FLAG_ZERO", "0");
        assert_eq!(env_bool("LLMRELAY_TEST_FLAG_ZERO"), Some(false));
        std::env::remove_var("LLMRELAY_TEST_FLAG_ZERO");

        std::env::set_var("LLMRELAY_TEST_FLAG_FALSE", "false");
        assert_eq!(env_bool("LLMRELAY_TEST_FLAG_FALSE"), Some(false));
        std::env::remove_var("LLMRELAY_TEST_FLAG_FALSE");

        std::env::set_var("LLMRELAY_TEST_FLAG_ON", "1");
        assert_eq!(env_bool("LLMRELAY_TEST_FLAG_ON"), Some(true));
        std::env::remove_var("LLMRELAY_TEST_FLAG_ON");
    }

    #[test]
    fn from_env_populates_the_env_layer_from_recognized_variables() {
        std::env::set_var("LLXPRT_PROFILE", "work-profile");
        std::env::set_var("CI", "true");
        std::env::remove_var("LLXPRT_NO_BROWSER_AUTH");

        let env = env_layer_from_process();
        assert_eq!(env.get("profile").and_then(SettingValue::as_str), Some("work-profile"));
        assert_eq!(env.get("ci").and_then(SettingValue::as_bool), Some(true));
        assert!(!env.contains_key("no-browser-auth"));

        std::env::remove_var("LLXPRT_PROFILE");
        std::env::remove_var("CI");
    }

    #[test]
    fn call_scoped_overlay_wins_over_base() {
        let mut base = SettingsMap::new();
        base.insert("model".into(), "base-model".into());
        let mut overlay = SettingsMap::new();
        overlay.insert("model".into(), "call-model".into());

        let view = CallScopedSettings::new(base, overlay);
        assert_eq!(view.get("model").unwrap().as_str(), Some("call-model"));
    }
}
