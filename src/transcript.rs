//! Live, in-memory conversation shared between the coordinator and a presenter.

use crate::message::ChatMessage;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Rows {
    messages: Vec<Arc<Mutex<ChatMessage>>>,
    by_id: HashMap<String, usize>,
}

/// Ordered messages, addressable by row or id.
///
/// Each message sits behind its own lock, so updates to different messages
/// never wait on each other; the row index is only locked to find or add rows.
#[derive(Default)]
pub struct Transcript {
    rows: RwLock<Rows>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` and return its row. An id already present is replaced in place.
    pub fn push(&self, message: ChatMessage) -> usize {
        let mut rows = self.rows.write();
        if let Some(&row) = rows.by_id.get(&message.id) {
            tracing::warn!(id = %message.id, row, "message id already in transcript; replacing");
            *rows.messages[row].lock() = message;
            return row;
        }
        let row = rows.messages.len();
        rows.by_id.insert(message.id.clone(), row);
        rows.messages.push(Arc::new(Mutex::new(message)));
        row
    }

    pub fn len(&self) -> usize {
        self.rows.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_message_row(&self, id: &str) -> Option<usize> {
        self.rows.read().by_id.get(id).copied()
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<ChatMessage>>> {
        let rows = self.rows.read();
        rows.by_id.get(id).map(|&row| rows.messages[row].clone())
    }

    /// Run `f` against the message with `id`, holding only that message's lock.
    pub fn with_message<R>(&self, id: &str, f: impl FnOnce(&mut ChatMessage) -> R) -> Option<R> {
        let entry = self.entry(id)?;
        let mut msg = entry.lock();
        Some(f(&mut *msg))
    }

    /// Append streamed text. Returns `false` if `id` is unknown.
    pub fn append_chunk(&self, id: &str, text: &str) -> bool {
        self.with_message(id, |m| m.append_text(text)).is_some()
    }

    pub fn message(&self, id: &str) -> Option<ChatMessage> {
        self.with_message(id, |m| m.clone())
    }

    pub fn message_at(&self, row: usize) -> Option<ChatMessage> {
        let entry = self.rows.read().messages.get(row).cloned()?;
        let msg = entry.lock().clone();
        Some(msg)
    }

    /// Copy of every message, in order.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        let entries: Vec<_> = self.rows.read().messages.clone();
        entries.iter().map(|e| e.lock().clone()).collect()
    }

    /// History to send for a request: everything before the row of `until_id`,
    /// or the whole transcript when it is absent.
    pub fn history_before(&self, until_id: &str) -> Vec<ChatMessage> {
        let mut all = self.snapshot();
        if let Some(row) = self.find_message_row(until_id) {
            all.truncate(row);
        }
        all
    }
}
