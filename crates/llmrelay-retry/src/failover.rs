//! Bucket failover: the outer layer over [`crate::retry::with_retry`] (§4.E).
//!
//! When the inner retry loop exhausts its attempts on a persistent rate
//! limit, the outer layer asks the active [`BucketFailover`] handle to
//! rotate to a different credential/endpoint bucket and, if one is
//! available, re-enters the retry loop exactly once more. Two consecutive
//! exhaustions terminate — this layer does not loop forever hunting for a
//! working bucket.
//!
//! The state bookkeeping (`AtomicU8` state + `Mutex<Instant>` last-change
//! timestamp) is the same shape the routing layer's circuit breaker uses,
//! repurposed from open/half-open/closed into "rotated/cooling-down".

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use llmrelay_core::error::{Error, Result};
use tracing::{info, warn};

use crate::retry::{with_retry, RetryOptions};

const STATE_STABLE: u8 = 0;
const STATE_ROTATED: u8 = 1;

#[async_trait]
pub trait BucketFailover: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn current_bucket(&self) -> String;

    /// Attempt to rotate to the next bucket. Returns `None` when no other
    /// bucket is available or a rotation happened too recently (the
    /// cooldown mirrors the circuit breaker's open-state timeout).
    fn try_failover(&self) -> Option<String>;
}

/// Round-robin failover across a fixed, pre-configured bucket list.
#[derive(Debug)]
pub struct RoundRobinFailover {
    buckets: Vec<String>,
    cursor: std::sync::atomic::AtomicUsize,
    state: AtomicU8,
    last_rotation: Mutex<Instant>,
    cooldown: Duration,
}

impl RoundRobinFailover {
    pub fn new(buckets: Vec<String>, cooldown: Duration) -> Self {
        Self {
            buckets,
            cursor: std::sync::atomic::AtomicUsize::new(0),
            state: AtomicU8::new(STATE_STABLE),
            last_rotation: Mutex::new(Instant::now() - cooldown),
            cooldown,
        }
    }
}

#[async_trait]
impl BucketFailover for RoundRobinFailover {
    fn is_enabled(&self) -> bool {
        self.buckets.len() > 1
    }

    fn current_bucket(&self) -> String {
        self.buckets
            .get(self.cursor.load(Ordering::Acquire) % self.buckets.len().max(1))
            .cloned()
            .unwrap_or_default()
    }

    fn try_failover(&self) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }

        let mut last = self.last_rotation.lock().unwrap();
        if last.elapsed() < self.cooldown {
            return None;
        }

        let next = self.cursor.fetch_add(1, Ordering::AcqRel) + 1;
        *last = Instant::now();
        self.state.store(STATE_ROTATED, Ordering::Release);
        let bucket = self.buckets[next % self.buckets.len()].clone();
        info!(bucket = %bucket, "rotated to next failover bucket");
        Some(bucket)
    }
}

/// A no-op handle for callers that haven't configured bucket failover.
#[derive(Debug, Default)]
pub struct NoFailover;

#[async_trait]
impl BucketFailover for NoFailover {
    fn is_enabled(&self) -> bool {
        false
    }

    fn current_bucket(&self) -> String {
        String::new()
    }

    fn try_failover(&self) -> Option<String> {
        None
    }
}

/// Wrap `operation` with retry, and on a final `RateLimited` verdict, ask
/// `failover` to rotate and re-enter the retry loop exactly once more.
pub async fn with_failover<F, Fut, T>(
    opts: RetryOptions,
    failover: &dyn BucketFailover,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let first = with_retry(opts, Error::is_retryable, &operation).await;

    let Err(error) = &first else {
        return first;
    };

    if !matches!(error, Error::RateLimited { .. }) || !failover.is_enabled() {
        return first;
    }

    match failover.try_failover() {
        Some(bucket) => {
            warn!(bucket = %bucket, "persistent rate limit, failing over and retrying once");
            with_retry(opts, Error::is_retryable, &operation).await
        }
        None => first,
    }
}
