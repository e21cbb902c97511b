use super::bridge::{bridge, offload, BlockingIter};
use super::http::{blocking_client, check_status, transport_error, QUERY_TIMEOUT};
use super::sse::SseEvents;
use super::state::ProviderState;
use super::types::{merge_catalog, resolve_key};
use super::{BackendConfig, ChatChunk, Options, Provider, StreamFuture};
use crate::error::BackendError;
use crate::message::{ChatMessage, Role, TokenUsage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::StreamExt;

pub const API_KEY_VARS: &[&str] = &["OPENAI_API_KEY"];
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Blocking chat-completions client.
pub trait OpenAiApi: Send + Sync {
    fn list_models(&self) -> Result<Vec<String>, BackendError>;

    fn stream_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<BlockingIter<ChatCompletionChunk>, BackendError>;
}

pub type OpenAiConnector = Box<dyn Fn(&str) -> Result<Arc<dyn OpenAiApi>, BackendError> + Send + Sync>;

struct Session {
    api: Arc<dyn OpenAiApi>,
    model: String,
    system_prompt: Option<String>,
}

/// OpenAI chat completions.
pub struct OpenAiProvider {
    connect: OpenAiConnector,
    key_vars: &'static [&'static str],
    state: ProviderState<Session>,
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Talk to an OpenAI-compatible endpoint other than api.openai.com.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self::with_connector(Box::new(move |key| {
            Ok(Arc::new(OpenAiHttp::new(&base_url, key)?) as Arc<dyn OpenAiApi>)
        }))
    }

    pub fn with_connector(connect: OpenAiConnector) -> Self {
        Self {
            connect,
            key_vars: API_KEY_VARS,
            state: ProviderState::default(),
        }
    }

    pub fn with_key_vars(mut self, vars: &'static [&'static str]) -> Self {
        self.key_vars = vars;
        self
    }

    fn try_configure(&self, config: &BackendConfig) -> Result<Session, BackendError> {
        let key = resolve_key(config, self.key_vars).ok_or_else(|| {
            BackendError::AuthenticationFailure(format!(
                "OpenAI API key not provided and not found in {}",
                self.key_vars.join(" / ")
            ))
        })?;
        let model = config.model_id.trim();
        if model.is_empty() {
            return Err(BackendError::InvalidRequest(
                "model name is required for OpenAI configuration".into(),
            ));
        }
        Ok(Session {
            api: (self.connect)(&key)?,
            model: model.to_string(),
            system_prompt: config.system_prompt(),
        })
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn configure(&self, config: BackendConfig) -> bool {
        tracing::info!(
            model = %config.model_id,
            system_prompt = config.system_prompt().is_some(),
            "configuring OpenAI provider"
        );
        self.state.reset();
        match self.try_configure(&config) {
            Ok(session) => {
                tracing::info!(model = %session.model, "OpenAI provider configured");
                self.state.install(session);
                true
            }
            Err(e) => self.state.fail_configure(e.context("OpenAI configuration failed")),
        }
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    fn last_error(&self) -> Option<String> {
        self.state.status().last_error()
    }

    fn response_stream(&self, history: &[ChatMessage], options: &Options) -> StreamFuture {
        tracing::info!(history = history.len(), ?options, "OpenAI: generating stream");
        let prepared = self.state.begin_stream().and_then(|(session, status)| {
            let request = build_request(&session, history, options).map_err(|e| status.record(e))?;
            Ok((session, status, request))
        });

        Box::pin(async move {
            let (session, status, request) = prepared?;
            tracing::debug!(messages = request.messages.len(), model = %session.model, "OpenAI: sending request");

            let api = session.api.clone();
            let chunks = offload("openai", move || api.stream_chat_completion(&request))
                .await
                .map_err(|e| status.record(e.context("OpenAI API error")))?;

            let mut pulls = bridge("openai", chunks);
            let reply = status.clone();
            let out = async_stream::stream! {
                let mut usage = None;
                let mut finished: Option<String> = None;
                while let Some(item) = pulls.next().await {
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            yield Err(status.record(e.context("OpenAI stream failed")));
                            break;
                        }
                    };

                    // Usage shows up on a terminal chunk; take it whenever it appears.
                    if let Some(u) = &chunk.usage {
                        usage = Some(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                        tracing::debug!(?usage, "OpenAI: usage reported");
                    }
                    // At most one chunk is read past the finish reason, for usage.
                    if finished.is_some() {
                        break;
                    }

                    let Some(choice) = chunk.choices.first() else {
                        continue;
                    };
                    if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                        yield Ok(ChatChunk::new(text));
                    }
                    if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
                        tracing::info!(reason, "OpenAI: finish reason received");
                        finished = Some(reason.to_string());
                        if usage.is_some() {
                            break;
                        }
                    }
                }
                if usage.is_none() {
                    tracing::warn!("OpenAI: token usage not found in stream");
                }
                status.set_usage(usage);
            };
            Ok(reply.wrap(out))
        })
    }

    fn available_models(&self) -> Vec<String> {
        let status = self.state.status();
        status.clear_error();
        let Some(session) = self.state.current() else {
            status.set_error("OpenAI provider is not configured; cannot list models");
            return Vec::new();
        };
        match session.api.list_models() {
            Ok(ids) => {
                let names = ids.into_iter().filter(|id| is_chat_model(id)).collect();
                merge_catalog(names, Some(&session.model))
            }
            Err(e) => {
                status.record(e.context("listing OpenAI models failed"));
                Vec::new()
            }
        }
    }

    fn last_token_usage(&self) -> Option<TokenUsage> {
        self.state.status().last_usage()
    }
}

/// GPT chat families, minus embedding/audio/image/instruct and non-turbo vision variants.
pub fn is_chat_model(id: &str) -> bool {
    const CHAT_PREFIXES: [&str; 2] = ["gpt-4", "gpt-3.5-turbo"];
    const EXCLUDED: [&str; 10] = [
        "embedding",
        "vision",
        "image",
        "audio",
        "edit",
        "instruct",
        "search",
        "similarity",
        "code-interpreter",
        "plugins",
    ];
    let id = id.to_lowercase();
    if !CHAT_PREFIXES.iter().any(|p| id.starts_with(p)) {
        return false;
    }
    if id.contains("vision") && id.contains("turbo") {
        return true;
    }
    !EXCLUDED.iter().any(|x| id.contains(x))
}

fn build_request(
    session: &Session,
    history: &[ChatMessage],
    options: &Options,
) -> Result<ChatCompletionRequest, BackendError> {
    let translated = to_messages(history, session.system_prompt.is_some());
    if translated.is_empty() {
        return Err(BackendError::InvalidRequest(
            "cannot send request: no valid messages in history for the OpenAI format".into(),
        ));
    }

    let mut messages = Vec::with_capacity(translated.len() + 1);
    if let Some(prompt) = &session.system_prompt {
        messages.push(WireMessage {
            role: "system",
            content: WireContent::Text(prompt.clone()),
        });
    }
    messages.extend(translated);

    Ok(ChatCompletionRequest {
        model: session.model.clone(),
        messages,
        stream: true,
        stream_options: Some(StreamOptions { include_usage: true }),
        temperature: options.temperature,
        max_tokens: options.max_tokens,
    })
}

/// Translate history. System turns pass through only when the provider has no
/// system prompt of its own.
fn to_messages(history: &[ChatMessage], has_system_prompt: bool) -> Vec<WireMessage> {
    let mut out = Vec::new();
    for msg in history {
        let role = match msg.role {
            Role::User | Role::Assistant => msg.role.as_str(),
            Role::System if !has_system_prompt => msg.role.as_str(),
            Role::System => {
                tracing::debug!(id = %msg.id, "skipping history system message; provider has a system prompt");
                continue;
            }
            Role::Error => {
                tracing::debug!(id = %msg.id, "skipping error message");
                continue;
            }
        };

        let text = msg.text();
        let text = text.trim();
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text: text.to_string() });
        }
        for img in msg.images() {
            if img.mime_type.is_empty() || img.data.is_empty() {
                tracing::warn!(id = %msg.id, "skipping malformed image part");
                continue;
            }
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", img.mime_type, img.data),
                },
            });
        }

        let has_image = parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. }));
        let content = if has_image {
            WireContent::Parts(parts)
        } else if !text.is_empty() {
            WireContent::Text(text.to_string())
        } else {
            tracing::warn!(id = %msg.id, role, "skipping message with no text or image content");
            continue;
        };
        out.push(WireMessage { role, content });
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: WireContent,
}

/// Plain string when the turn is text only, typed parts once an image is involved.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WireUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// REST client for OpenAI-compatible `/chat/completions`.
pub struct OpenAiHttp {
    http: reqwest::blocking::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiHttp {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, BackendError> {
        Ok(Self {
            http: blocking_client()?,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl OpenAiApi for OpenAiHttp {
    fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let resp = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(QUERY_TIMEOUT)
            .send()
            .map_err(transport_error)?;
        let list: ModelList = check_status(resp)?.json().map_err(transport_error)?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    fn stream_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<BlockingIter<ChatCompletionChunk>, BackendError> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .map_err(transport_error)?;
        let resp = check_status(resp)?;

        let chunks = SseEvents::new(resp)
            .map(|data| data.and_then(|d| Ok(serde_json::from_str::<ChatCompletionChunk>(&d)?)));
        Ok(Box::new(chunks))
    }
}
