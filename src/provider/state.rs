//! Configuration and diagnostics state shared by every provider.

use super::types::{ChatChunk, ResponseStream};
use crate::error::BackendError;
use crate::message::TokenUsage;
use futures_core::stream::Stream;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Last-error and last-usage cells. Streams hold an `Arc` so they can report
/// after the call that created them has returned.
#[derive(Debug, Default)]
pub(crate) struct Status {
    last_error: Mutex<Option<String>>,
    last_usage: Mutex<Option<TokenUsage>>,
}

impl Status {
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    /// Store `err` as the last error and hand it back.
    pub fn record(&self, err: BackendError) -> BackendError {
        tracing::error!(kind = %err.kind(), "{err}");
        self.set_error(err.to_string());
        err
    }

    pub fn last_usage(&self) -> Option<TokenUsage> {
        *self.last_usage.lock()
    }

    pub fn set_usage(&self, usage: Option<TokenUsage>) {
        *self.last_usage.lock() = usage;
    }
}

/// Diagnostics of one stream, mirrored into the provider-wide [`Status`].
#[derive(Debug, Clone)]
pub(crate) struct StreamStatus {
    shared: Arc<Status>,
    own: Arc<Status>,
}

impl StreamStatus {
    pub fn record(&self, err: BackendError) -> BackendError {
        self.own.set_error(err.to_string());
        self.shared.record(err)
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.own.set_error(message.clone());
        self.shared.set_error(message);
    }

    pub fn set_usage(&self, usage: Option<TokenUsage>) {
        self.own.set_usage(usage);
        self.shared.set_usage(usage);
    }

    /// Box `chunks` as a [`ResponseStream`] that reports this stream's diagnostics.
    pub fn wrap<St>(&self, chunks: St) -> ResponseStream
    where
        St: Stream<Item = Result<ChatChunk, BackendError>> + Send + 'static,
    {
        ResponseStream::new(chunks, self.own.clone())
    }
}

/// The active configuration snapshot plus [`Status`].
///
/// A snapshot is installed whole and never mutated; in-flight streams keep
/// the `Arc` they started with.
#[derive(Debug)]
pub(crate) struct ProviderState<S> {
    active: RwLock<Option<Arc<S>>>,
    status: Arc<Status>,
}

impl<S> Default for ProviderState<S> {
    fn default() -> Self {
        Self {
            active: RwLock::new(None),
            status: Arc::new(Status::default()),
        }
    }
}

impl<S> ProviderState<S> {
    pub fn status(&self) -> &Arc<Status> {
        &self.status
    }

    pub fn current(&self) -> Option<Arc<S>> {
        self.active.read().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.active.read().is_some()
    }

    /// Drop the current snapshot and reset diagnostics ahead of a configure attempt.
    pub fn reset(&self) {
        *self.active.write() = None;
        self.status.clear_error();
        self.status.set_usage(None);
    }

    pub fn install(&self, session: S) {
        *self.active.write() = Some(Arc::new(session));
    }

    /// Reset diagnostics for a new stream and return the snapshot it runs
    /// against, with a fresh [`StreamStatus`].
    pub fn begin_stream(&self) -> Result<(Arc<S>, StreamStatus), BackendError> {
        self.status.clear_error();
        self.status.set_usage(None);
        let session = self
            .current()
            .ok_or_else(|| self.status.record(BackendError::NotConfigured("provider is not configured".into())))?;
        let status = StreamStatus {
            shared: self.status.clone(),
            own: Arc::new(Status::default()),
        };
        Ok((session, status))
    }

    /// Record a configure failure; always returns `false`.
    pub fn fail_configure(&self, err: BackendError) -> bool {
        *self.active.write() = None;
        self.status.record(err);
        false
    }
}
