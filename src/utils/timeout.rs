//! Timeout helpers for upstream calls
//!
//! Every upstream attempt runs under a deadline, and streamed replies are
//! additionally bounded by how long they may go quiet between chunks.

use futures::{Stream, StreamExt};
use std::future::Future;
use std::time::Duration;

/// Apply a deadline to a fallible async operation
pub async fn with_timeout<T, E>(
    timeout: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, TimeoutError<E>> {
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TimeoutError::Inner(err)),
        Err(_) => Err(TimeoutError::Timeout(timeout)),
    }
}

/// Wait for the next stream item, giving up after `idle` of silence
pub async fn next_within<S>(idle: Duration, stream: &mut S) -> Result<Option<S::Item>, Duration>
where
    S: Stream + Unpin,
{
    tokio::time::timeout(idle, stream.next())
        .await
        .map_err(|_| idle)
}

/// Error type for timeout operations
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError<E> {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Inner(E),
}

impl<E> TimeoutError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutError::Timeout(_))
    }

    /// Get the inner error if not a timeout
    pub fn into_inner(self) -> Option<E> {
        match self {
            TimeoutError::Inner(e) => Some(e),
            TimeoutError::Timeout(_) => None,
        }
    }
}
