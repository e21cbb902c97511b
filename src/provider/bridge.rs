//! Turning blocking provider iterators into async streams.
//!
//! Provider clients are synchronous. The call that opens a stream runs through
//! [`offload`]; the iterator it returns is drained by [`bridge`] on a blocking
//! worker, one item at a time, into a single-slot channel.

use crate::error::BackendError;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Boxed blocking iterator as returned by provider clients.
pub type BlockingIter<T> = Box<dyn Iterator<Item = Result<T, BackendError>> + Send>;

/// Run a blocking call on the blocking pool and await its result.
pub async fn offload<F, T>(label: &'static str, f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res,
        Err(e) => Err(BackendError::UnknownFailure(format!("{label}: blocking call failed: {e}"))),
    }
}

/// Drain `iter` on a blocking worker and republish its items in order.
///
/// The stream ends when the iterator is exhausted, right after the first
/// `Err` item, or when the worker panics (reported as an `Err` item). If the
/// consumer drops the stream, the worker stops before its next pull.
pub fn bridge<I, T>(label: &'static str, iter: I) -> ReceiverStream<Result<T, BackendError>>
where
    I: Iterator<Item = Result<T, BackendError>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<T, BackendError>>(1);

    tokio::task::spawn_blocking(move || {
        let mut iter = iter;
        let mut pulled = 0usize;
        loop {
            if tx.is_closed() {
                tracing::debug!(label, pulled, "consumer dropped; abandoning stream");
                return;
            }

            let item = match panic::catch_unwind(AssertUnwindSafe(|| iter.next())) {
                Ok(Some(item)) => item,
                Ok(None) => {
                    tracing::debug!(label, pulled, "provider iterator exhausted");
                    return;
                }
                Err(_) => Err(BackendError::UnknownFailure(format!(
                    "{label}: worker panicked while reading the stream"
                ))),
            };

            let failed = item.is_err();
            if tx.blocking_send(item).is_err() {
                tracing::debug!(label, pulled, "consumer dropped; abandoning stream");
                return;
            }
            if failed {
                return;
            }
            pulled += 1;
        }
    });

    ReceiverStream::new(rx)
}
