use super::bridge::{bridge, offload, BlockingIter};
use super::http::{blocking_client, check_status, transport_error, QUERY_TIMEOUT};
use super::sse::SseEvents;
use super::state::ProviderState;
use super::types::{merge_catalog, resolve_key};
use super::{BackendConfig, ChatChunk, Options, Provider, StreamFuture};
use crate::error::BackendError;
use crate::message::{ChatMessage, Role, TokenUsage};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::StreamExt;

/// Environment variables consulted when `configure` gets no API key.
pub const API_KEY_VARS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Blocking Gemini client.
pub trait GeminiApi: Send + Sync {
    fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError>;

    /// Open a streaming generation. Each item is one response chunk.
    fn stream_generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<BlockingIter<GenerateContentResponse>, BackendError>;
}

pub type GeminiConnector = Box<dyn Fn(&str) -> Result<Arc<dyn GeminiApi>, BackendError> + Send + Sync>;

struct Session {
    api: Arc<dyn GeminiApi>,
    model: String,
    system_prompt: Option<String>,
}

/// Google Gemini (Generative Language API).
pub struct GoogleProvider {
    connect: GeminiConnector,
    key_vars: &'static [&'static str],
    state: ProviderState<Session>,
}

impl Default for GoogleProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GoogleProvider {
    pub fn new() -> Self {
        Self::with_connector(Box::new(|key| Ok(Arc::new(GeminiHttp::new(key)?) as Arc<dyn GeminiApi>)))
    }

    pub fn with_connector(connect: GeminiConnector) -> Self {
        Self {
            connect,
            key_vars: API_KEY_VARS,
            state: ProviderState::default(),
        }
    }

    /// Override the environment fallback for the API key; empty disables it.
    pub fn with_key_vars(mut self, vars: &'static [&'static str]) -> Self {
        self.key_vars = vars;
        self
    }

    fn try_configure(&self, config: &BackendConfig) -> Result<Session, BackendError> {
        let model = config.model_id.trim();
        if model.is_empty() {
            return Err(BackendError::InvalidRequest(
                "model name is required for configuration".into(),
            ));
        }
        let key = resolve_key(config, self.key_vars).ok_or_else(|| {
            BackendError::AuthenticationFailure(format!(
                "no Gemini API key given and none found in {}",
                self.key_vars.join(" / ")
            ))
        })?;
        let key_prefix: String = key.chars().take(5).collect();
        tracing::info!(%key_prefix, "configuring Gemini client");

        let api = (self.connect)(&key)?;
        Ok(Session {
            api,
            model: model.trim_start_matches("models/").to_string(),
            system_prompt: config.system_prompt(),
        })
    }
}

impl Provider for GoogleProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn configure(&self, config: BackendConfig) -> bool {
        tracing::info!(
            model = %config.model_id,
            system_prompt = config.system_prompt().is_some(),
            "configuring Gemini provider"
        );
        self.state.reset();
        match self.try_configure(&config) {
            Ok(session) => {
                tracing::info!(model = %session.model, "Gemini provider configured");
                self.state.install(session);
                true
            }
            Err(e) => self.state.fail_configure(e.context("Gemini configuration failed")),
        }
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    fn last_error(&self) -> Option<String> {
        self.state.status().last_error()
    }

    fn response_stream(&self, history: &[ChatMessage], options: &Options) -> StreamFuture {
        tracing::info!(history = history.len(), ?options, "Gemini: generating stream");
        let prepared = self.state.begin_stream().and_then(|(session, status)| {
            let request = build_request(&session, history, options).map_err(|e| status.record(e))?;
            Ok((session, status, request))
        });

        Box::pin(async move {
            let (session, status, request) = prepared?;
            tracing::debug!(
                entries = request.contents.len(),
                model = %session.model,
                "Gemini: sending request"
            );

            let api = session.api.clone();
            let model = session.model.clone();
            let chunks = offload("gemini", move || api.stream_generate_content(&model, &request))
                .await
                .map_err(|e| status.record(e.context("Gemini API error")))?;

            let mut pulls = bridge("gemini", chunks);
            let reply = status.clone();
            let out = async_stream::stream! {
                let mut usage = None;
                let mut count = 0usize;
                while let Some(item) = pulls.next().await {
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            yield Err(status.record(e.context("Gemini stream failed")));
                            break;
                        }
                    };
                    count += 1;

                    if let Some(reason) = block_reason(&chunk) {
                        let msg = format!("Content blocked by API safety filters: {reason}.");
                        tracing::warn!("Gemini: {msg}");
                        status.set_error(msg.clone());
                        yield Ok(ChatChunk::system_error(msg));
                        break;
                    }
                    if let Some(meta) = &chunk.usage_metadata {
                        usage = TokenUsage::from_parts(meta.prompt_token_count, meta.candidates_token_count);
                    }
                    if let Some(text) = extract_text(&chunk) {
                        yield Ok(ChatChunk { text });
                    }
                }
                tracing::info!(chunks = count, ?usage, "Gemini: stream finished");
                status.set_usage(usage);
            };
            Ok(reply.wrap(out))
        })
    }

    fn available_models(&self) -> Vec<String> {
        let status = self.state.status();
        status.clear_error();
        let Some(session) = self.state.current() else {
            status.set_error("Gemini provider is not configured; cannot list models");
            return Vec::new();
        };
        match session.api.list_models() {
            Ok(models) => {
                let names = models
                    .iter()
                    .filter(|m| is_chat_model(m))
                    .map(|m| m.name.trim_start_matches("models/").to_string())
                    .collect();
                merge_catalog(names, Some(&session.model))
            }
            Err(e) => {
                status.record(e.context("listing Gemini models failed"));
                Vec::new()
            }
        }
    }

    fn last_token_usage(&self) -> Option<TokenUsage> {
        self.state.status().last_usage()
    }
}

/// Gemini models that can hold a text chat: support `generateContent`, are in
/// the `gemini` family and are not embedding/attribution/retrieval variants.
pub fn is_chat_model(model: &ModelInfo) -> bool {
    const UNWANTED: [&str; 3] = ["embedding", "aqa", "retriever"];
    model.supported_generation_methods.iter().any(|m| m == "generateContent")
        && model.name.contains("gemini")
        && !UNWANTED.iter().any(|u| model.name.contains(u))
}

fn build_request(
    session: &Session,
    history: &[ChatMessage],
    options: &Options,
) -> Result<GenerateContentRequest, BackendError> {
    let contents = to_contents(history);
    if contents.is_empty() {
        return Err(BackendError::InvalidRequest(
            "cannot send request: no valid messages in history for the Gemini format".into(),
        ));
    }

    let generation_config = options.temperature.map(|t| GenerationConfig { temperature: Some(t) });

    Ok(GenerateContentRequest {
        contents,
        system_instruction: session.system_prompt.as_ref().map(|p| Content {
            role: None,
            parts: vec![Part::text(p.clone())],
        }),
        safety_settings: HARM_CATEGORIES
            .iter()
            .map(|c| SafetySetting {
                category: c.to_string(),
                threshold: "BLOCK_NONE".to_string(),
            })
            .collect(),
        generation_config,
    })
}

/// Keep user/assistant turns, mapping non-blank text and images to parts.
fn to_contents(history: &[ChatMessage]) -> Vec<Content> {
    let mut skipped = 0usize;
    let mut out = Vec::new();
    for msg in history {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "model",
            Role::System | Role::Error => {
                skipped += 1;
                continue;
            }
        };

        let mut parts = Vec::new();
        for part in &msg.parts {
            match part {
                crate::message::Part::Text { text } => {
                    let text = text.trim();
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                }
                crate::message::Part::Image(img) => parts.push(Part {
                    text: None,
                    inline_data: Some(Blob {
                        mime_type: img.mime_type.clone(),
                        data: img.data.clone(),
                    }),
                }),
            }
        }

        if parts.is_empty() {
            skipped += 1;
            continue;
        }
        out.push(Content {
            role: Some(role.to_string()),
            parts,
        });
    }
    if skipped > 0 {
        tracing::debug!(skipped, "skipped messages not sendable to Gemini");
    }
    out
}

fn block_reason(r: &GenerateContentResponse) -> Option<String> {
    if let Some(reason) = r.prompt_feedback.as_ref().and_then(|f| f.block_reason.as_ref()) {
        return Some(reason.clone());
    }
    r.candidates
        .iter()
        .filter_map(|c| c.finish_reason.as_deref())
        .find(|reason| *reason == "SAFETY")
        .map(str::to_string)
}

/// Concatenate the text parts of every candidate.
fn extract_text(r: &GenerateContentResponse) -> Option<String> {
    let out: String = r
        .candidates
        .iter()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .collect();
    if out.is_empty() { None } else { Some(out) }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub safety_settings: Vec<SafetySetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<u64>,
    #[serde(default)]
    pub candidates_token_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub supported_generation_methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// REST client for `generativelanguage.googleapis.com`.
pub struct GeminiHttp {
    http: reqwest::blocking::Client,
    api_key: String,
    api_base: Url,
}

impl GeminiHttp {
    pub fn new(api_key: &str) -> Result<Self, BackendError> {
        let api_base = Url::parse("https://generativelanguage.googleapis.com/")
            .map_err(|e| BackendError::UnknownFailure(e.to_string()))?;
        Ok(Self {
            http: blocking_client()?,
            api_key: api_key.to_string(),
            api_base,
        })
    }

    fn build_url(&self, path: &str) -> Result<Url, BackendError> {
        let mut url = self
            .api_base
            .join(path)
            .map_err(|e| BackendError::InvalidRequest(format!("bad Gemini URL: {e}")))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

impl GeminiApi for GeminiHttp {
    fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.build_url("v1beta/models")?;
            url.query_pairs_mut().append_pair("pageSize", "1000");
            if let Some(tok) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", tok);
            }
            let resp = self
                .http
                .get(url)
                .timeout(QUERY_TIMEOUT)
                .send()
                .map_err(transport_error)?;
            let page: ListModelsResponse = check_status(resp)?.json().map_err(transport_error)?;
            out.extend(page.models);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(tok) => page_token = Some(tok),
                None => break,
            }
        }
        Ok(out)
    }

    fn stream_generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<BlockingIter<GenerateContentResponse>, BackendError> {
        // v1beta:streamGenerateContent supports Server-Sent Events with alt=sse.
        let mut url = self.build_url(&format!("v1beta/models/{model}:streamGenerateContent"))?;
        url.query_pairs_mut().append_pair("alt", "sse");

        let resp = self.http.post(url).json(request).send().map_err(transport_error)?;
        let resp = check_status(resp)?;

        let chunks = SseEvents::new(resp)
            .map(|data| data.and_then(|d| Ok(serde_json::from_str::<GenerateContentResponse>(&d)?)));
        Ok(Box::new(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session() -> Session {
        struct Unused;
        impl GeminiApi for Unused {
            fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
                unreachable!()
            }
            fn stream_generate_content(
                &self,
                _: &str,
                _: &GenerateContentRequest,
            ) -> Result<BlockingIter<GenerateContentResponse>, BackendError> {
                unreachable!()
            }
        }
        Session {
            api: Arc::new(Unused),
            model: "gemini-1.5-flash".into(),
            system_prompt: Some("be terse".into()),
        }
    }

    #[test]
    fn history_keeps_only_user_and_assistant_text() {
        let history = vec![
            ChatMessage::system("ignored"),
            ChatMessage::user("  hi  "),
            ChatMessage::error("boom"),
            ChatMessage::assistant("   "),
            ChatMessage::assistant("hello"),
        ];
        let contents = to_contents(&history);
        let shape: Vec<(String, String)> = contents
            .iter()
            .map(|c| (c.role.clone().unwrap(), c.parts[0].text.clone().unwrap()))
            .collect();
        assert_eq!(
            shape,
            vec![("user".to_string(), "hi".to_string()), ("model".to_string(), "hello".to_string())]
        );
    }

    #[test]
    fn request_carries_only_supplied_options() {
        let req = build_request(&session(), &[ChatMessage::user("q")], &Options::default()).unwrap();
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("generationConfig").is_none());
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(json["safetySettings"].as_array().unwrap().len(), 4);

        let opts = Options {
            temperature: Some(3.5),
            max_tokens: Some(10),
        };
        let req = build_request(&session(), &[ChatMessage::user("q")], &opts).unwrap();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["generationConfig"], serde_json::json!({"temperature": 3.5}));
    }

    #[test]
    fn images_become_inline_data() {
        let msg = ChatMessage::user("what is this").with_image("image/png", "aGk=");
        let json = serde_json::to_value(to_contents(&[msg])).unwrap();
        assert_eq!(
            json[0]["parts"][1]["inlineData"],
            serde_json::json!({"mimeType": "image/png", "data": "aGk="})
        );
    }

    #[test]
    fn empty_history_is_invalid() {
        let err = build_request(&session(), &[ChatMessage::system("x")], &Options::default()).unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[test]
    fn parses_stream_chunk() {
        let raw = r#"{
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}, {"text": "lo"}]}}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }"#;
        let chunk: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_text(&chunk).as_deref(), Some("Hello"));
        assert_eq!(block_reason(&chunk), None);
        assert_eq!(chunk.usage_metadata.unwrap().prompt_token_count, Some(4));
    }

    #[test]
    fn detects_block_reasons() {
        let blocked: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#).unwrap();
        assert_eq!(block_reason(&blocked).as_deref(), Some("SAFETY"));

        let cut: GenerateContentResponse =
            serde_json::from_str(r#"{"candidates": [{"finishReason": "SAFETY"}]}"#).unwrap();
        assert_eq!(block_reason(&cut).as_deref(), Some("SAFETY"));

        let normal: GenerateContentResponse =
            serde_json::from_str(r#"{"candidates": [{"finishReason": "STOP"}]}"#).unwrap();
        assert_eq!(block_reason(&normal), None);
    }

    #[test]
    fn chat_model_filter() {
        let m = |name: &str, methods: &[&str]| ModelInfo {
            name: name.into(),
            supported_generation_methods: methods.iter().map(|s| s.to_string()).collect(),
        };
        assert!(is_chat_model(&m("models/gemini-1.5-pro", &["generateContent"])));
        assert!(!is_chat_model(&m("models/gemini-embedding-001", &["generateContent"])));
        assert!(!is_chat_model(&m("models/aqa", &["generateAnswer"])));
        assert!(!is_chat_model(&m("models/gemini-pro", &["embedContent"])));
        assert!(!is_chat_model(&m("models/text-bison-001", &["generateContent"])));
    }
}
