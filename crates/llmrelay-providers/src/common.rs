//! Shared HTTP plumbing and request-building helpers every adapter calls
//! into, grounded on the egress connector's client/header-handling
//! conventions but factored up one level since this crate carries five
//! adapter families instead of two.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use llmrelay_core::error::{Error as CoreError, Result as CoreResult};
use llmrelay_core::provider::{ContentStream, ResolvedCall};
pub use llmrelay_retry::{with_failover, with_retry, BucketFailover, NoFailover, RetryOptions};
use llmrelay_retry::retry_stream;
use reqwest::{Client, ClientBuilder, RequestBuilder};
use thiserror::Error;
use tracing::debug;

/// Transport-level error, the egress analogue of the core taxonomy.
/// Adapters convert these into [`llmrelay_core::error::Error`] at the
/// boundary via `From`, mirroring how the teacher layers `EgressError`
/// under `lunaroute_core::Error`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider {provider} returned status {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("sse stream error: {0}")]
    Sse(String),

    #[error("http client configuration error: {0}")]
    ConfigError(String),
}

impl TransportError {
    pub fn into_core_error(self, provider: &str) -> CoreError {
        match self {
            TransportError::Http(e) if e.is_connect() || e.is_timeout() => {
                CoreError::TransientUpstream {
                    provider: provider.to_string(),
                    status: None,
                    message: e.to_string(),
                }
            }
            TransportError::Http(e) => CoreError::TransientUpstream {
                provider: provider.to_string(),
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            },
            TransportError::ProviderError { status, message, .. } => match status {
                429 => CoreError::RateLimited {
                    provider: provider.to_string(),
                    retry_after_secs: None,
                },
                500..=599 => CoreError::TransientUpstream {
                    provider: provider.to_string(),
                    status: Some(status),
                    message,
                },
                _ => CoreError::BadUpstream {
                    provider: provider.to_string(),
                    status,
                    message,
                },
            },
            TransportError::Sse(message) => CoreError::StreamInterrupted {
                provider: provider.to_string(),
                message,
            },
            TransportError::ConfigError(message) => CoreError::Configuration(message),
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// HTTP client configuration: timeouts/pool sizing tuned the same way the
/// egress client is, since long-lived streaming responses (extended
/// thinking, slow tool loops) need the same idle-connection handling.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            user_agent: format!("llmrelay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub fn create_client(config: &HttpClientConfig) -> TransportResult<Client> {
    ClientBuilder::new()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(&config.user_agent)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| TransportError::ConfigError(format!("failed to create HTTP client: {e}")))
}

/// Attach the resolved auth token (as a bearer header unless `header_name`
/// says otherwise) and every custom header from `resolved`, redacting the
/// credential before it's ever logged.
pub fn apply_auth_and_headers(
    mut builder: RequestBuilder,
    resolved: &ResolvedCall,
    auth_header_name: &str,
) -> RequestBuilder {
    if let Some(token) = &resolved.auth_token {
        let value = if auth_header_name.eq_ignore_ascii_case("authorization") {
            format!("Bearer {token}")
        } else {
            token.clone()
        };
        builder = builder.header(auth_header_name, value);
    }

    for (name, value) in &resolved.custom_headers {
        builder = builder.header(name, value);
    }

    debug!(
        headers = ?redacted_headers(resolved, auth_header_name),
        "issuing upstream request"
    );
    builder
}

fn redacted_headers(resolved: &ResolvedCall, auth_header_name: &str) -> HashMap<String, String> {
    let mut redacted = resolved.custom_headers.clone();
    if resolved.auth_token.is_some() {
        redacted.insert(auth_header_name.to_string(), "<api_key>".to_string());
    }
    redacted
}

/// Issue `build_request` (rebuilt fresh on every attempt, since a
/// [`RequestBuilder`] is consumed by `send()`) through the retry and bucket
/// failover envelope (§4.E): exponential backoff on a retryable error, then
/// one failover rotation and retry pass if the exhausted verdict is a
/// persistent rate limit. Adapters without a configured multi-bucket setup
/// pass [`NoFailover`], which makes this equivalent to a bare retry loop.
pub async fn send_with_retry<F>(
    provider: &str,
    retry_opts: RetryOptions,
    failover: &dyn BucketFailover,
    build_request: F,
) -> CoreResult<reqwest::Response>
where
    F: Fn() -> RequestBuilder + Send + Sync,
{
    with_failover(retry_opts, failover, || async {
        let response = build_request()
            .send()
            .await
            .map_err(TransportError::Http)
            .map_err(|e| e.into_core_error(provider))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::ProviderError {
                provider: provider.to_string(),
                status,
                message,
            }
            .into_core_error(provider));
        }

        Ok(response)
    })
    .await
}

/// Wrap a streaming call's request-to-first-byte sequence in the retry
/// envelope: `make_stream` re-issues the whole HTTP request from scratch
/// (typically via [`send_with_retry`] internally) whenever the in-flight
/// stream yields a retryable error, bounded by `retry_opts.max_retries`
/// restarts. The attempt tag [`llmrelay_retry::stream::Attempted`] wraps is
/// stripped here — adapters don't need it, only `retry_stream`'s own tests
/// do.
pub fn retrying_stream<F, Fut>(retry_opts: RetryOptions, make_stream: F) -> ContentStream
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CoreResult<ContentStream>> + Send + 'static,
{
    let stream = retry_stream(retry_opts, CoreError::is_retryable, make_stream);
    Box::pin(stream.map(|item| item.map(|attempted| attempted.item)))
}

/// Merge provider-family defaults with the orchestrator's resolved
/// `request_params` overlay; overlay always wins on key collision.
pub fn merged_request_params(
    defaults: serde_json::Map<String, serde_json::Value>,
    resolved: &ResolvedCall,
) -> serde_json::Map<String, serde_json::Value> {
    let mut merged = defaults;
    for (k, v) in &resolved.request_params {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_config_matches_streaming_tuned_values() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout_secs, 600);
        assert_eq!(config.pool_max_idle_per_host, 32);
        assert!(config.user_agent.starts_with("llmrelay/"));
    }

    #[test]
    fn create_client_succeeds_with_defaults() {
        let config = HttpClientConfig::default();
        assert!(create_client(&config).is_ok());
    }

    #[test]
    fn rate_limit_status_maps_to_rate_limited_error() {
        let err = TransportError::ProviderError {
            provider: "openai".into(),
            status: 429,
            message: "too many requests".into(),
        };
        let core = err.into_core_error("openai");
        assert!(matches!(core, CoreError::RateLimited { .. }));
    }

    #[test]
    fn server_error_status_maps_to_transient_upstream() {
        let err = TransportError::ProviderError {
            provider: "anthropic".into(),
            status: 503,
            message: "overloaded".into(),
        };
        let core = err.into_core_error("anthropic");
        assert!(matches!(core, CoreError::TransientUpstream { .. }));
    }

    #[test]
    fn client_error_status_maps_to_bad_upstream() {
        let err = TransportError::ProviderError {
            provider: "openai".into(),
            status: 400,
            message: "bad request".into(),
        };
        let core = err.into_core_error("openai");
        assert!(matches!(core, CoreError::BadUpstream { status: 400, .. }));
    }

    #[tokio::test]
    async fn send_with_retry_recovers_from_one_429_then_succeeds() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let retry_opts = RetryOptions { max_retries: 2, base_delay_ms: 1 };
        let response = send_with_retry("openai", retry_opts, &NoFailover, || client.post(server.uri())).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn send_with_retry_does_not_retry_a_client_error() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let retry_opts = RetryOptions { max_retries: 2, base_delay_ms: 1 };
        let err = send_with_retry("openai", retry_opts, &NoFailover, || client.post(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BadUpstream { status: 400, .. }));
    }
}
