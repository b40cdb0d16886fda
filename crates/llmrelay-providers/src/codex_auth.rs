//! Codex-over-ChatGPT OAuth token reading: `~/.codex/auth.json`, nested
//! dot-notation field extraction, `~` expansion. Adapted from the egress
//! connector's Codex auth reader for use by [`crate::openai_responses`].

use std::path::{Path, PathBuf};

use llmrelay_core::error::{ConfigurationError, Error, Result};
use serde_json::Value;
use tracing::{debug, warn};

/// Read a token (or account id) from Codex's `auth.json`, following a
/// dot-notation field path (e.g. `"tokens.access_token"`).
pub async fn read_codex_token(auth_file: &Path, token_field: &str) -> Result<Option<String>> {
    let expanded_path = expand_tilde(auth_file)?;

    debug!(path = %expanded_path.display(), field = token_field, "reading codex auth token");

    if !tokio::fs::try_exists(&expanded_path).await.unwrap_or(false) {
        debug!(path = %expanded_path.display(), "codex auth file does not exist");
        return Ok(None);
    }

    let contents = tokio::fs::read_to_string(&expanded_path)
        .await
        .map_err(|e| {
            Error::from(ConfigurationError::KeyfileUnreadable(format!(
                "{}: {e}",
                expanded_path.display()
            )))
        })?;

    let json: Value = serde_json::from_str(&contents)?;
    let token_value = extract_nested_field(&json, token_field);

    match token_value {
        Some(Value::String(token)) if !token.is_empty() => Ok(Some(token.clone())),
        Some(Value::String(_)) => {
            warn!(path = %expanded_path.display(), "codex auth token field is empty");
            Ok(None)
        }
        Some(_) => {
            warn!(field = token_field, "codex auth token field is not a string");
            Ok(None)
        }
        None => {
            warn!(field = token_field, "codex auth token field not found");
            Ok(None)
        }
    }
}

fn extract_nested_field<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(json, |current, part| current.get(part))
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::Configuration("invalid UTF-8 in codex auth path".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Configuration("could not determine home directory".to_string()))?;
        Ok(home.join(stripped))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| Error::Configuration("could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_returns_none() {
        let token = read_codex_token(Path::new("/definitely/not/a/real/auth.json"), "tokens.access_token")
            .await
            .unwrap();
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn reads_nested_dot_path_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        tokio::fs::write(
            &path,
            r#"{"tokens":{"access_token":"tok_abc123","account_id":"acct_1"}}"#,
        )
        .await
        .unwrap();

        let token = read_codex_token(&path, "tokens.access_token").await.unwrap();
        assert_eq!(token.as_deref(), Some("tok_abc123"));

        let account = read_codex_token(&path, "tokens.account_id").await.unwrap();
        assert_eq!(account.as_deref(), Some("acct_1"));
    }

    #[tokio::test]
    async fn missing_field_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        tokio::fs::write(&path, r#"{"tokens":{}}"#).await.unwrap();

        let token = read_codex_token(&path, "tokens.access_token").await.unwrap();
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn empty_token_string_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        tokio::fs::write(&path, r#"{"tokens":{"access_token":""}}"#)
            .await
            .unwrap();

        let token = read_codex_token(&path, "tokens.access_token").await.unwrap();
        assert!(token.is_none());
    }
}
