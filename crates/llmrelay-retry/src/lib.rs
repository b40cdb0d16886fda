//! Retry, backoff, and bucket failover for the llmrelay client runtime.

pub mod failover;
pub mod retry;
pub mod stream;

pub use failover::{with_failover, BucketFailover, NoFailover, RoundRobinFailover};
pub use retry::{with_retry, RetryOptions};
pub use stream::{retry_stream, Attempted};
