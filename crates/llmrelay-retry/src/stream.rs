//! End-to-end stream re-attempt (§4.E, §9).
//!
//! When a retryable error surfaces mid-stream, the whole upstream request is
//! re-issued from scratch (bounded by the same retry budget as
//! [`crate::retry::with_retry`]). The spec is explicit that exactly-once
//! delivery is out of scope here, so each yielded item carries the attempt
//! number it was produced on and callers who care about a duplicated prefix
//! after a restart are expected to de-duplicate themselves.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use llmrelay_core::error::{Error, Result};
use tracing::warn;

use crate::retry::RetryOptions;

/// One item from a retried stream, tagged with the attempt it was produced
/// on so a caller can detect a restart (`attempt` increases) and decide
/// whether to discard a duplicated prefix.
#[derive(Debug, Clone)]
pub struct Attempted<T> {
    pub attempt: u32,
    pub item: T,
}

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;
type MakeStreamFuture<T> = Pin<Box<dyn std::future::Future<Output = Result<BoxStream<T>>> + Send>>;

struct State<T> {
    opts: RetryOptions,
    should_retry: Box<dyn Fn(&Error) -> bool + Send + Sync>,
    make_stream: Box<dyn Fn() -> MakeStreamFuture<T> + Send + Sync>,
}

enum UnfoldState<T> {
    NeedStream { state: State<T>, attempt: u32 },
    Active { state: State<T>, stream: BoxStream<T>, attempt: u32 },
    Done,
}

/// Re-issue `make_stream` from scratch whenever the in-flight stream yields
/// a retryable error, up to `opts.max_retries` restarts.
pub fn retry_stream<T, F, Fut>(
    opts: RetryOptions,
    should_retry: impl Fn(&Error) -> bool + Send + Sync + 'static,
    make_stream: F,
) -> Pin<Box<dyn Stream<Item = Result<Attempted<T>>> + Send>>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<BoxStream<T>>> + Send + 'static,
{
    let state = State {
        opts,
        should_retry: Box::new(should_retry),
        make_stream: Box::new(move || Box::pin(make_stream()) as MakeStreamFuture<T>),
    };

    Box::pin(futures::stream::unfold(
        UnfoldState::NeedStream { state, attempt: 0 },
        step,
    ))
}

async fn step<T: Send + 'static>(
    unfold_state: UnfoldState<T>,
) -> Option<(Result<Attempted<T>>, UnfoldState<T>)> {
    let (mut state, mut stream, mut attempt) = match unfold_state {
        UnfoldState::Done => return None,
        UnfoldState::NeedStream { state, attempt } => match (state.make_stream)().await {
            Ok(stream) => (state, stream, attempt),
            Err(error) => return Some((Err(error), UnfoldState::Done)),
        },
        UnfoldState::Active { state, stream, attempt } => (state, stream, attempt),
    };

    // Loop internally across any number of restarts so each call to this
    // function either yields a real item or ends the stream for good —
    // `unfold` only gets one Option per poll, it never sees an empty step.
    loop {
        match stream.next().await {
            Some(Ok(item)) => {
                return Some((Ok(Attempted { attempt, item }), UnfoldState::Active { state, stream, attempt }));
            }
            Some(Err(error)) => {
                if (state.should_retry)(&error) && attempt < state.opts.max_retries {
                    attempt += 1;
                    let backoff = state.opts.backoff_for_attempt(attempt);
                    tokio::time::sleep(backoff).await;
                    warn!(attempt, %error, "stream interrupted, restarting from scratch");
                    match (state.make_stream)().await {
                        Ok(fresh) => {
                            stream = fresh;
                            continue;
                        }
                        Err(restart_error) => return Some((Err(restart_error), UnfoldState::Done)),
                    }
                } else {
                    return Some((Err(error), UnfoldState::Done));
                }
            }
            None => return None,
        }
    }
}
