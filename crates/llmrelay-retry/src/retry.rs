//! Exponential-backoff retry for a single request/response call (§4.E).
//!
//! The backoff shape (`100ms * 2^(attempt-1)`) and overall loop structure
//! mirror the egress client's retry helper; the classifier is pulled out
//! into a parameter instead of being hardcoded to a fixed set of status
//! codes, since this crate's callers need 400-is-never-retryable alongside
//! DNS/connect-reset distinctions the teacher's classifier didn't need to
//! make.

use std::future::Future;
use std::time::Duration;

use llmrelay_core::error::{Error, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetryOptions {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        debug_assert!(attempt > 0);
        Duration::from_millis(self.base_delay_ms * 2u64.pow(attempt - 1))
    }
}

/// Retry `operation` under `opts`, reattempting only errors for which
/// `should_retry` returns true. Defaults to [`Error::is_retryable`] when
/// callers don't need a different classification.
pub async fn with_retry<F, Fut, T>(
    opts: RetryOptions,
    should_retry: impl Fn(&Error) -> bool,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=opts.max_retries {
        if attempt > 0 {
            let backoff = opts.backoff_for_attempt(attempt);
            debug!(attempt, max_retries = opts.max_retries, ?backoff, "retrying after backoff");
            tokio::time::sleep(backoff).await;
        }

        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                let retryable = should_retry(&error);
                if retryable && attempt < opts.max_retries {
                    warn!(attempt, max_retries = opts.max_retries, %error, "request failed, will retry");
                    last_error = Some(error);
                } else {
                    return Err(error);
                }
            }
        }
    }

    Err(last_error.unwrap_or(Error::Fatal("retry loop exited unexpectedly".to_string())))
}
