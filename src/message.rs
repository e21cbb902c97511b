//! Conversation records exchanged between callers and backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key marking a message whose text is still being streamed.
pub const META_STREAMING: &str = "is_streaming";

/// Metadata key marking an internal, non-display message.
pub const META_INTERNAL: &str = "is_internal";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Error => "error",
        }
    }
}

/// An inline image attachment. `data` is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePart {
    pub mime_type: String,
    pub data: String,
}

/// One content fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    Image(ImagePart),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn image(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part::Image(ImagePart {
            mime_type: mime_type.into(),
            data: data.into(),
        })
    }
}

/// Lifecycle of an assistant message while its reply is generated.
///
/// `Completed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadingState {
    #[default]
    Idle,
    Loading,
    Completed,
    Error,
}

impl LoadingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadingState::Completed | LoadingState::Error)
    }

    /// Whether `self -> next` is a legal step.
    pub fn can_advance_to(self, next: LoadingState) -> bool {
        use LoadingState::*;
        matches!(
            (self, next),
            (Idle, Loading) | (Loading, Loading) | (Loading, Completed) | (Loading, Error) | (Idle, Error)
        )
    }

    /// State as a renderer with a single "done" indicator would show it.
    pub fn display(self) -> LoadingState {
        match self {
            LoadingState::Error => LoadingState::Completed,
            other => other,
        }
    }
}

/// Prompt and completion token counts reported for one finished stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Both counters or nothing; a half-reported pair is treated as absent.
    pub fn from_parts(prompt: Option<u64>, completion: Option<u64>) -> Option<Self> {
        Some(Self::new(prompt?, completion?))
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable for the life of the message. For assistant replies it equals the
    /// request identifier that produced them.
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub loading_state: LoadingState,
}

impl ChatMessage {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            parts,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            loading_state: LoadingState::Idle,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(Role::Error, vec![Part::text(text)])
    }

    /// Empty assistant message that a stream for `request_id` will fill in.
    pub fn placeholder(request_id: impl Into<String>) -> Self {
        Self {
            id: request_id.into(),
            ..Self::new(Role::Assistant, Vec::new())
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_image(mut self, mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        self.parts.push(Part::image(mime_type, data));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Concatenation of all text parts, in order.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::Image(_) => None,
            })
            .collect()
    }

    pub fn images(&self) -> impl Iterator<Item = &ImagePart> {
        self.parts.iter().filter_map(|p| match p {
            Part::Image(img) => Some(img),
            Part::Text { .. } => None,
        })
    }

    pub fn has_images(&self) -> bool {
        self.images().next().is_some()
    }

    /// Append streamed text to the trailing text part, starting one if needed.
    pub fn append_text(&mut self, chunk: &str) {
        if let Some(Part::Text { text }) = self.parts.last_mut() {
            text.push_str(chunk);
        } else {
            self.parts.push(Part::text(chunk));
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.flag(META_STREAMING)
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        if streaming {
            self.metadata.insert(META_STREAMING.to_string(), true.into());
        } else {
            self.metadata.remove(META_STREAMING);
        }
    }

    pub fn is_internal(&self) -> bool {
        self.flag(META_INTERNAL)
    }

    fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn advance(&mut self, next: LoadingState) -> bool {
        if !self.loading_state.can_advance_to(next) {
            return false;
        }
        self.loading_state = next;
        true
    }
}
