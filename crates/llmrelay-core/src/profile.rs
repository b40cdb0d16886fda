//! Profile: a serializable bundle of provider/model/params, validated
//! before it is ever applied to the settings stack (§4.A, §6, §8.7).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigurationError;

const MAX_PROFILE_BYTES: usize = 10 * 1024;
const DISALLOWED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub version: i64,
    pub provider: String,
    pub model: String,
    #[serde(default, rename = "modelParams")]
    pub model_params: HashMap<String, Value>,
    #[serde(default, rename = "ephemeralSettings")]
    pub ephemeral_settings: HashMap<String, Value>,
}

impl Profile {
    /// Parse and validate raw profile JSON in one step, per spec.md §6.
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        if raw.len() > MAX_PROFILE_BYTES {
            return Err(ConfigurationError::SizeOverrun(raw.len()));
        }

        let value: Value =
            serde_json::from_str(raw).map_err(|e| ConfigurationError::ParseFailure(e.to_string()))?;

        check_disallowed_keys(&value)?;

        let profile: Profile =
            serde_json::from_value(value).map_err(|e| ConfigurationError::ParseFailure(e.to_string()))?;

        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.version != 1 {
            return Err(ConfigurationError::UnsupportedVersion(self.version));
        }
        if self.provider.is_empty() {
            return Err(ConfigurationError::MissingField("provider"));
        }
        if self.model.is_empty() {
            return Err(ConfigurationError::MissingField("model"));
        }
        let serialized = serde_json::to_string(self).unwrap_or_default();
        if serialized.len() > MAX_PROFILE_BYTES {
            return Err(ConfigurationError::SizeOverrun(serialized.len()));
        }
        Ok(())
    }
}

/// Where an active profile came from: an inline JSON blob (`--profile`) or
/// the name of a saved profile to load (`--profile-load`). The two are
/// mutually exclusive (§8 scenario g) — a caller who somehow has both must
/// be rejected before either is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    Inline(String),
    Load(String),
    None,
}

/// Resolve which of the two profile flags is active, rejecting the case
/// where both were supplied.
pub fn resolve_profile_source(
    inline: Option<&str>,
    load_name: Option<&str>,
) -> Result<ProfileSource, ConfigurationError> {
    match (inline, load_name) {
        (Some(_), Some(_)) => Err(ConfigurationError::MutuallyExclusiveProfileFlags),
        (Some(raw), None) => Ok(ProfileSource::Inline(raw.to_string())),
        (None, Some(name)) => Ok(ProfileSource::Load(name.to_string())),
        (None, None) => Ok(ProfileSource::None),
    }
}

/// Recursive walk over the raw JSON tree, rejecting any object key at any
/// depth that matches the disallowed set. Checked *before* deserializing
/// into `Profile` so a dangerous key can't hide behind a field the struct
/// doesn't surface.
fn check_disallowed_keys(value: &Value) -> Result<(), ConfigurationError> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if DISALLOWED_KEYS.contains(&key.as_str()) {
                    return Err(ConfigurationError::DisallowedKey(key.clone()));
                }
                check_disallowed_keys(nested)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_disallowed_keys(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_profile() {
        let raw = r#"{"version":1,"provider":"openai","model":"gpt-4o","modelParams":{"temperature":0.5},"ephemeralSettings":{"streaming":"disabled"}}"#;
        let profile = Profile::parse(raw).unwrap();
        assert_eq!(profile.provider, "openai");
        assert_eq!(profile.model, "gpt-4o");
    }

    #[test]
    fn rejects_unsupported_version() {
        let raw = r#"{"version":2,"provider":"openai","model":"gpt-4o"}"#;
        let err = Profile::parse(raw).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_missing_fields() {
        let raw = r#"{"version":1,"model":"gpt-4o"}"#;
        let err = Profile::parse(raw);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = Profile::parse("{not json").unwrap_err();
        assert!(matches!(err, ConfigurationError::ParseFailure(_)));
    }

    #[test]
    fn rejects_oversized_profile() {
        let padding = "x".repeat(11 * 1024);
        let raw = format!(
            r#"{{"version":1,"provider":"openai","model":"gpt-4o","modelParams":{{"note":"{padding}"}}}}"#
        );
        let err = Profile::parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigurationError::SizeOverrun(_)));
    }

    #[test]
    fn rejects_dunder_proto_at_top_level() {
        let raw = r#"{"version":1,"provider":"openai","model":"gpt-4o","__proto__":{}}"#;
        let err = Profile::parse(raw).unwrap_err();
        assert!(matches!(err, ConfigurationError::DisallowedKey(_)));
    }

    #[test]
    fn rejects_constructor_nested_in_model_params() {
        let raw = r#"{"version":1,"provider":"openai","model":"gpt-4o","modelParams":{"constructor":{"polluted":true}}}"#;
        let err = Profile::parse(raw).unwrap_err();
        assert!(matches!(err, ConfigurationError::DisallowedKey(_)));
    }

    #[test]
    fn rejects_prototype_inside_array() {
        let raw = r#"{"version":1,"provider":"openai","model":"gpt-4o","ephemeralSettings":{"list":[{"prototype":1}]}}"#;
        let err = Profile::parse(raw).unwrap_err();
        assert!(matches!(err, ConfigurationError::DisallowedKey(_)));
    }

    #[test]
    fn resolve_profile_source_picks_inline_when_only_inline_is_set() {
        let source = resolve_profile_source(Some("{}"), None).unwrap();
        assert_eq!(source, ProfileSource::Inline("{}".to_string()));
    }

    #[test]
    fn resolve_profile_source_picks_load_when_only_load_is_set() {
        let source = resolve_profile_source(None, Some("work")).unwrap();
        assert_eq!(source, ProfileSource::Load("work".to_string()));
    }

    #[test]
    fn resolve_profile_source_defaults_to_none() {
        let source = resolve_profile_source(None, None).unwrap();
        assert_eq!(source, ProfileSource::None);
    }

    #[test]
    fn resolve_profile_source_rejects_both_flags_set() {
        let err = resolve_profile_source(Some("{}"), Some("work")).unwrap_err();
        assert_eq!(err, ConfigurationError::MutuallyExclusiveProfileFlags);
    }
}
