//! Error taxonomy for the llmrelay core.
//!
//! Every user-visible error carries the provider name, the status code when
//! known, a one-sentence cause, and a sanitized request identifier. Secrets
//! (API keys, OAuth tokens, keyfile contents) must never be embedded here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request for provider {provider}: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication error for provider {provider}: {reason}")]
    Authentication { provider: String, reason: String },

    #[error("rate limited by {provider}{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    #[error("transient upstream error from {provider} (status {status:?}): {message}")]
    TransientUpstream {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("upstream rejected request to {provider} (status {status}): {message}")]
    BadUpstream {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("stream interrupted for {provider}: {message}")]
    StreamInterrupted { provider: String, message: String },

    #[error("tool history invariant violated: {0}")]
    ToolHistory(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the retry envelope (§4.E) may reattempt this error.
    ///
    /// `BadUpstream`, `InvalidRequest`, `Configuration`, `ToolHistory`,
    /// `Cancelled`, and `Fatal` are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::TransientUpstream { .. } | Error::StreamInterrupted { .. }
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("profile JSON failed to parse: {0}")]
    ParseFailure(String),

    #[error("profile is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("profile version {0} is not supported (expected 1)")]
    UnsupportedVersion(i64),

    #[error("profile exceeds the 10 KiB size cap ({0} bytes)")]
    SizeOverrun(usize),

    #[error("profile contains a disallowed key '{0}'")]
    DisallowedKey(String),

    #[error("keyfile unreadable and no auth-key fallback is set: {0}")]
    KeyfileUnreadable(String),

    #[error("invalid value for ephemeral setting 'streaming': {0}")]
    InvalidStreamingValue(String),

    #[error("both --profile and --profile-load were supplied; these are mutually exclusive")]
    MutuallyExclusiveProfileFlags,
}

impl From<ConfigurationError> for Error {
    fn from(value: ConfigurationError) -> Self {
        Error::Configuration(value.to_string())
    }
}
