use super::state::Status;
use crate::error::BackendError;
use crate::message::{ChatMessage, TokenUsage};
use futures_core::stream::{BoxStream, Stream};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// What a caller hands to [`Provider::configure`].
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// API key. Cloud providers fall back to their environment variable when absent.
    pub credential: Option<String>,
    pub model_id: String,
    pub system_prompt: Option<String>,
}

impl BackendConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Trimmed credential, or `None` when absent or blank.
    pub(crate) fn credential(&self) -> Option<&str> {
        self.credential.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub(crate) fn system_prompt(&self) -> Option<String> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Per-request generation options. Providers ignore options they have no
/// equivalent for.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Options {
    /// Passed through unclamped.
    pub temperature: Option<f64>,
    /// Chat-completions providers only.
    pub max_tokens: Option<u32>,
}

impl Options {
    /// Read recognized keys from a loosely typed map; unknown keys are ignored.
    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            temperature: map.get("temperature").and_then(serde_json::Value::as_f64),
            max_tokens: map
                .get("max_tokens")
                .and_then(serde_json::Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChunk {
    pub text: String,
}

impl ChatChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Terminal chunk that reports a failure inline instead of raising it.
    pub fn system_error(message: impl std::fmt::Display) -> Self {
        Self {
            text: format!("[SYSTEM ERROR: {message}]"),
        }
    }
}

/// The chunks of one reply.
///
/// Carries its own diagnostics, so the usage read after draining belongs to
/// this stream even when other streams run on the same provider.
pub struct ResponseStream {
    chunks: BoxStream<'static, Result<ChatChunk, BackendError>>,
    status: Arc<Status>,
}

impl ResponseStream {
    pub(crate) fn new<S>(chunks: S, status: Arc<Status>) -> Self
    where
        S: Stream<Item = Result<ChatChunk, BackendError>> + Send + 'static,
    {
        Self {
            chunks: Box::pin(chunks),
            status,
        }
    }

    /// Usage this stream reported. `None` until the stream is drained, and
    /// when the backend sent no figures.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.status.last_usage()
    }

    /// The failure this stream recorded, if any.
    pub fn error(&self) -> Option<String> {
        self.status.last_error()
    }
}

impl Stream for ResponseStream {
    type Item = Result<ChatChunk, BackendError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.as_mut().poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

pub type StreamFuture = Pin<Box<dyn Future<Output = Result<ResponseStream, BackendError>> + Send>>;

/// A chat backend.
///
/// Every method except [`Provider::response_stream`] may block on I/O; async
/// callers should go through [`crate::coordinator::Coordinator`], which runs
/// them on the blocking pool.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replace the whole configuration. On failure the provider is left
    /// unconfigured and [`Provider::last_error`] says why.
    fn configure(&self, config: BackendConfig) -> bool;

    fn is_configured(&self) -> bool;

    fn last_error(&self) -> Option<String>;

    /// Start streaming a response.
    ///
    /// Resolves to an error, before any chunk exists, when the provider is
    /// unconfigured or `history` has nothing the provider can send.
    fn response_stream(&self, history: &[ChatMessage], options: &Options) -> StreamFuture;

    /// Chat-capable models, always including the configured one; sorted, deduplicated.
    fn available_models(&self) -> Vec<String>;

    /// Usage of the most recently completed stream.
    fn last_token_usage(&self) -> Option<TokenUsage>;
}

/// Explicit credential, else the first non-blank environment variable in `vars`.
pub(crate) fn resolve_key(config: &BackendConfig, vars: &[&str]) -> Option<String> {
    if let Some(key) = config.credential() {
        return Some(key.to_string());
    }
    vars.iter()
        .filter_map(|v| std::env::var(v).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Add the configured model to a catalog listing, then sort and deduplicate.
pub(crate) fn merge_catalog(mut names: Vec<String>, configured: Option<&str>) -> Vec<String> {
    if let Some(model) = configured {
        if !names.iter().any(|n| n == model) {
            tracing::warn!(model, "configured model missing from catalog; adding it");
            names.push(model.to_string());
        }
    }
    names.sort();
    names.dedup();
    names
}
