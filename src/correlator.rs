//! Binds stream lifecycle events to the request that produced them.

use crate::message::{LoadingState, TokenUsage};
use crate::transcript::Transcript;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct Entry {
    backend: String,
    state: LoadingState,
    error: Option<String>,
    usage: Option<TokenUsage>,
}

/// Registry of `request_id -> (backend, state)`.
///
/// Events for one request are serialized on that request's entry; events for
/// different requests only share a read lock on the registry map.
pub struct Correlator {
    transcript: Arc<Transcript>,
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl Correlator {
    pub fn new(transcript: Arc<Transcript>) -> Self {
        Self {
            transcript,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn transcript(&self) -> &Arc<Transcript> {
        &self.transcript
    }

    /// Start tracking `request_id` for `backend`. A terminal entry for the same
    /// id is replaced; a live one is kept and `false` returned.
    pub fn register(&self, request_id: &str, backend: &str) -> bool {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(request_id) {
            let e = existing.lock();
            if !e.state.is_terminal() {
                tracing::warn!(request_id, backend = %e.backend, "request already in flight");
                return false;
            }
        }
        entries.insert(
            request_id.to_string(),
            Arc::new(Mutex::new(Entry {
                backend: backend.to_string(),
                state: LoadingState::Idle,
                error: None,
                usage: None,
            })),
        );
        true
    }

    fn entry(&self, request_id: &str) -> Option<Arc<Mutex<Entry>>> {
        self.entries.read().get(request_id).cloned()
    }

    /// Apply a lifecycle step to the entry and its message.
    fn transition(&self, request_id: &str, event: &str, next: LoadingState, update: impl FnOnce(&mut Entry)) -> bool {
        let Some(entry) = self.entry(request_id) else {
            tracing::warn!(request_id, event, "event for unknown request; ignored");
            return false;
        };
        let mut e = entry.lock();
        if !e.state.can_advance_to(next) {
            tracing::warn!(request_id, event, from = ?e.state, to = ?next, "illegal state transition; ignored");
            return false;
        }
        e.state = next;
        update(&mut *e);

        let applied = self.transcript.with_message(request_id, |m| {
            m.advance(next);
            m.set_streaming(next == LoadingState::Loading);
        });
        if applied.is_none() {
            tracing::debug!(request_id, event, "no transcript message for request");
        }
        true
    }

    /// The reply began streaming.
    pub fn notify_started(&self, request_id: &str) -> bool {
        tracing::debug!(request_id, "stream started");
        self.transition(request_id, "started", LoadingState::Loading, |_| {})
    }

    /// Append one chunk to the request's message. Chunks after a terminal
    /// event are dropped.
    pub fn notify_chunk(&self, request_id: &str, text: &str) -> bool {
        let Some(entry) = self.entry(request_id) else {
            tracing::warn!(request_id, "chunk for unknown request; dropped");
            return false;
        };
        let e = entry.lock();
        if e.state != LoadingState::Loading {
            tracing::warn!(request_id, state = ?e.state, "chunk outside loading state; dropped");
            return false;
        }
        self.transcript.append_chunk(request_id, text)
    }

    /// The stream ended successfully. `message` carries the assembled reply;
    /// its parts replace whatever was accumulated from chunks.
    pub fn notify_finished(
        &self,
        request_id: &str,
        message: &crate::message::ChatMessage,
        usage: Option<TokenUsage>,
    ) -> bool {
        tracing::debug!(request_id, ?usage, "stream finished");
        let parts = message.parts.clone();
        let done = self.transition(request_id, "finished", LoadingState::Completed, |e| e.usage = usage);
        if done {
            self.transcript.with_message(request_id, |m| m.parts = parts);
        }
        done
    }

    /// The stream failed. The error text is kept for [`Correlator::error`].
    pub fn notify_error(&self, request_id: &str, error_text: &str) -> bool {
        tracing::debug!(request_id, error_text, "stream failed");
        let text = error_text.to_string();
        self.transition(request_id, "error", LoadingState::Error, |e| e.error = Some(text))
    }

    pub fn find_message_row(&self, request_id: &str) -> Option<usize> {
        self.transcript.find_message_row(request_id)
    }

    pub fn state(&self, request_id: &str) -> Option<LoadingState> {
        self.entry(request_id).map(|e| e.lock().state)
    }

    pub fn backend(&self, request_id: &str) -> Option<String> {
        self.entry(request_id).map(|e| e.lock().backend.clone())
    }

    pub fn error(&self, request_id: &str) -> Option<String> {
        self.entry(request_id).and_then(|e| e.lock().error.clone())
    }

    pub fn usage(&self, request_id: &str) -> Option<TokenUsage> {
        self.entry(request_id).and_then(|e| e.lock().usage)
    }

    /// Requests that have not reached a terminal state.
    pub fn in_flight(&self) -> Vec<String> {
        let entries = self.entries.read();
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| !e.lock().state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
