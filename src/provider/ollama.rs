use super::bridge::{bridge, offload, BlockingIter};
use super::http::{blocking_client, check_status, transport_error, QUERY_TIMEOUT};
use super::state::ProviderState;
use super::types::merge_catalog;
use super::{BackendConfig, ChatChunk, Options, Provider, StreamFuture};
use crate::error::BackendError;
use crate::message::{ChatMessage, Role, TokenUsage};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use tokio_stream::StreamExt;

pub const HOST_VAR: &str = "OLLAMA_HOST";
pub const DEFAULT_HOST: &str = "http://localhost:11434";

/// Blocking client for a local Ollama server.
pub trait OllamaApi: Send + Sync {
    fn list_models(&self) -> Result<Vec<ModelTag>, BackendError>;

    fn chat(&self, request: &ChatRequest) -> Result<BlockingIter<OllamaChunk>, BackendError>;
}

pub type OllamaConnector = Box<dyn Fn(&str) -> Result<Arc<dyn OllamaApi>, BackendError> + Send + Sync>;

struct Session {
    api: Arc<dyn OllamaApi>,
    model: String,
    system_prompt: Option<String>,
}

/// Models served by a local Ollama instance.
pub struct OllamaProvider {
    host: String,
    connect: OllamaConnector,
    state: ProviderState<Session>,
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl OllamaProvider {
    /// `host` wins over `OLLAMA_HOST`, which wins over [`DEFAULT_HOST`].
    pub fn new(host: Option<String>) -> Self {
        Self::with_connector(
            resolve_host(host),
            Box::new(|host| Ok(Arc::new(OllamaHttp::new(host)?) as Arc<dyn OllamaApi>)),
        )
    }

    pub fn with_connector(host: impl Into<String>, connect: OllamaConnector) -> Self {
        Self {
            host: host.into(),
            connect,
            state: ProviderState::default(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn try_configure(&self, config: &BackendConfig) -> Result<Session, BackendError> {
        let model = config.model_id.trim();
        if model.is_empty() {
            return Err(BackendError::InvalidRequest(
                "model ID is required for Ollama configuration".into(),
            ));
        }
        let api = (self.connect)(&self.host)?;

        // An unreachable server must fail here, not on first send.
        let models = api
            .list_models()
            .map_err(|e| e.context(format!("failed to reach Ollama at {}", self.host)))?;
        tracing::debug!(host = %self.host, models = models.len(), "Ollama server reachable");

        Ok(Session {
            api,
            model: model.to_string(),
            system_prompt: config.system_prompt(),
        })
    }
}

fn resolve_host(explicit: Option<String>) -> String {
    let host = explicit
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::env::var(HOST_VAR)
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    normalize_host(&host)
}

/// `localhost:11434` and `http://localhost:11434/` both become `http://localhost:11434`.
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn configure(&self, config: BackendConfig) -> bool {
        tracing::info!(
            model = %config.model_id,
            host = %self.host,
            system_prompt = config.system_prompt().is_some(),
            "configuring Ollama provider"
        );
        self.state.reset();
        match self.try_configure(&config) {
            Ok(session) => {
                tracing::info!(model = %session.model, host = %self.host, "Ollama provider configured");
                self.state.install(session);
                true
            }
            Err(e) => self.state.fail_configure(e.context("Ollama configuration failed")),
        }
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    fn last_error(&self) -> Option<String> {
        self.state.status().last_error()
    }

    fn response_stream(&self, history: &[ChatMessage], options: &Options) -> StreamFuture {
        tracing::info!(history = history.len(), ?options, "Ollama: generating stream");
        let prepared = self.state.begin_stream().and_then(|(session, status)| {
            let request = build_request(&session, history, options).map_err(|e| status.record(e))?;
            Ok((session, status, request))
        });

        Box::pin(async move {
            let (session, status, request) = prepared?;
            tracing::debug!(messages = request.messages.len(), model = %session.model, "Ollama: sending request");

            let api = session.api.clone();
            let chunks = offload("ollama", move || api.chat(&request))
                .await
                .map_err(|e| status.record(e.context("Ollama API error")))?;

            let mut pulls = bridge("ollama", chunks);
            let reply = status.clone();
            let out = async_stream::stream! {
                let mut usage = None;
                while let Some(item) = pulls.next().await {
                    // Failures inside the sequence become an inline error chunk.
                    let chunk = match item.and_then(OllamaChunk::into_result) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            let e = status.record(e.context("Ollama stream failed"));
                            yield Ok(ChatChunk::system_error(e.message()));
                            break;
                        }
                    };

                    if let Some(text) = chunk.message.as_ref().map(|m| m.content.as_str()).filter(|t| !t.is_empty()) {
                        yield Ok(ChatChunk::new(text));
                    }
                    if chunk.done {
                        usage = TokenUsage::from_parts(chunk.prompt_eval_count, chunk.eval_count);
                        tracing::debug!(?usage, reason = ?chunk.done_reason, "Ollama: final chunk");
                        break;
                    }
                }
                status.set_usage(usage);
            };
            Ok(reply.wrap(out))
        })
    }

    fn available_models(&self) -> Vec<String> {
        let status = self.state.status();
        status.clear_error();
        let configured = self.state.current();
        let api = match &configured {
            Some(session) => session.api.clone(),
            None => match (self.connect)(&self.host) {
                Ok(api) => api,
                Err(e) => {
                    status.record(e.context("Ollama client unavailable"));
                    return Vec::new();
                }
            },
        };
        match api.list_models() {
            Ok(tags) => {
                let names = tags.into_iter().filter_map(ModelTag::into_name).collect();
                merge_catalog(names, configured.as_ref().map(|s| s.model.as_str()))
            }
            Err(e) => {
                status.record(e.context("listing Ollama models failed"));
                Vec::new()
            }
        }
    }

    fn last_token_usage(&self) -> Option<TokenUsage> {
        self.state.status().last_usage()
    }
}

fn build_request(session: &Session, history: &[ChatMessage], options: &Options) -> Result<ChatRequest, BackendError> {
    let translated = to_messages(history, session.system_prompt.is_some());
    if translated.is_empty() {
        return Err(BackendError::InvalidRequest(
            "cannot send request: no valid messages in history for Ollama".into(),
        ));
    }

    let mut messages = Vec::with_capacity(translated.len() + 1);
    if let Some(prompt) = &session.system_prompt {
        messages.push(OllamaMessage {
            role: "system",
            content: prompt.clone(),
            images: None,
        });
    }
    messages.extend(translated);

    Ok(ChatRequest {
        model: session.model.clone(),
        messages,
        stream: true,
        options: options.temperature.map(|t| ModelOptions { temperature: Some(t) }),
    })
}

fn to_messages(history: &[ChatMessage], has_system_prompt: bool) -> Vec<OllamaMessage> {
    let mut out = Vec::new();
    for msg in history {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System if has_system_prompt || msg.is_internal() => continue,
            Role::System => "system",
            Role::Error => continue,
        };

        let images: Vec<String> = msg
            .images()
            .filter(|img| match base64::engine::general_purpose::STANDARD.decode(&img.data) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(id = %msg.id, mime = %img.mime_type, "dropping malformed base64 image: {e}");
                    false
                }
            })
            .map(|img| img.data.clone())
            .collect();

        let content = msg.text().trim().to_string();
        if content.is_empty() && images.is_empty() {
            continue;
        }
        out.push(OllamaMessage {
            role,
            content,
            images: (!images.is_empty()).then_some(images),
        });
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ModelOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OllamaMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// One NDJSON line of `/api/chat`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OllamaChunk {
    #[serde(default)]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    /// Set instead of `message` when the server fails mid-stream.
    #[serde(default)]
    pub error: Option<String>,
}

impl OllamaChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message: Some(ChunkMessage { content: text.into() }),
            ..Default::default()
        }
    }

    fn into_result(self) -> Result<Self, BackendError> {
        match &self.error {
            Some(e) => Err(BackendError::UnknownFailure(e.clone())),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkMessage {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTag {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ModelTag {
    fn into_name(self) -> Option<String> {
        self.name.or(self.model).filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

/// REST client for the Ollama HTTP API.
pub struct OllamaHttp {
    http: reqwest::blocking::Client,
    host: String,
}

impl OllamaHttp {
    pub fn new(host: &str) -> Result<Self, BackendError> {
        Ok(Self {
            http: blocking_client()?,
            host: normalize_host(host),
        })
    }
}

impl OllamaApi for OllamaHttp {
    fn list_models(&self) -> Result<Vec<ModelTag>, BackendError> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.host))
            .timeout(QUERY_TIMEOUT)
            .send()
            .map_err(transport_error)?;
        let tags: TagsResponse = check_status(resp)?.json().map_err(transport_error)?;
        Ok(tags.models)
    }

    fn chat(&self, request: &ChatRequest) -> Result<BlockingIter<OllamaChunk>, BackendError> {
        let resp = self
            .http
            .post(format!("{}/api/chat", self.host))
            .json(request)
            .send()
            .map_err(transport_error)?;
        let resp = check_status(resp)?;

        let chunks = BufReader::new(resp).lines().filter_map(|line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(serde_json::from_str::<OllamaChunk>(&line).map_err(BackendError::from)),
            Err(e) => Some(Err(BackendError::ProviderUnavailable(format!("network stream error: {e}")))),
        });
        Ok(Box::new(chunks))
    }
}
