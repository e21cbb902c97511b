//! Request dispatch over the registered providers.
//!
//! Each request runs as its own task: it opens the provider stream, feeds the
//! [`Correlator`] and publishes [`StreamEvent`]s until the stream ends, fails
//! or is cancelled.

use crate::correlator::Correlator;
use crate::error::BackendError;
use crate::message::{ChatMessage, TokenUsage};
use crate::provider::bridge::offload;
use crate::provider::{BackendConfig, Options, Provider};
use crate::transcript::Transcript;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Completion text for a successful stream that produced nothing.
pub const EMPTY_RESPONSE: &str = "[AI returned an empty response]";
/// Error text for a request cancelled by the caller.
pub const CANCELLED: &str = "[AI response cancelled by user]";

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications, in order `Started`, `Chunk`*, then `Finished` or `Error` per request.
///
/// The channel is bounded: a subscriber that falls behind gets
/// `RecvError::Lagged` and misses events. The [`Transcript`] always holds the
/// complete reply and is the copy to render from after a lag.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Started {
        backend: String,
        request_id: String,
    },
    Chunk {
        backend: String,
        request_id: String,
        text: String,
    },
    Finished {
        backend: String,
        request_id: String,
        message: ChatMessage,
        usage: Option<TokenUsage>,
    },
    Error {
        backend: String,
        request_id: String,
        message: String,
    },
    /// Result of [`Coordinator::configure_backend`]. `models` is the catalog
    /// fetched after a successful configure; empty when `ok` is false.
    Configured {
        backend: String,
        model: String,
        ok: bool,
        models: Vec<String>,
    },
    /// Emitted when the set of running requests becomes non-empty or empty.
    Busy(bool),
}

impl StreamEvent {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Started { request_id, .. }
            | StreamEvent::Chunk { request_id, .. }
            | StreamEvent::Finished { request_id, .. }
            | StreamEvent::Error { request_id, .. } => Some(request_id.as_str()),
            StreamEvent::Configured { .. } | StreamEvent::Busy(_) => None,
        }
    }
}

type RequestKey = (String, String);

struct Inner {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    configs: RwLock<HashMap<String, BackendConfig>>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<StreamEvent>,
    running: Mutex<HashMap<RequestKey, CancellationToken>>,
    running_count: watch::Sender<usize>,
}

impl Inner {
    fn emit(&self, event: StreamEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fail(&self, backend: &str, request_id: &str, message: String) {
        self.correlator.notify_error(request_id, &message);
        self.emit(StreamEvent::Error {
            backend: backend.to_string(),
            request_id: request_id.to_string(),
            message,
        });
    }

    fn finish_task(&self, key: &RequestKey) {
        let left = {
            let mut running = self.running.lock();
            running.remove(key);
            running.len()
        };
        self.running_count.send_replace(left);
        if left == 0 {
            tracing::info!("all requests finished");
            self.emit(StreamEvent::Busy(false));
        }
    }
}

/// Owns the provider registry and drives requests against it.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(transcript: Arc<Transcript>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (running_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                providers: RwLock::new(HashMap::new()),
                configs: RwLock::new(HashMap::new()),
                correlator: Arc::new(Correlator::new(transcript)),
                events,
                running: Mutex::new(HashMap::new()),
                running_count,
            }),
        }
    }

    /// Register `provider` under `backend_id`, replacing any previous one.
    pub fn register(&self, backend_id: impl Into<String>, provider: Arc<dyn Provider>) {
        let backend_id = backend_id.into();
        tracing::info!(backend = %backend_id, provider = provider.name(), "registering provider");
        self.inner.providers.write().insert(backend_id, provider);
    }

    pub fn provider(&self, backend_id: &str) -> Option<Arc<dyn Provider>> {
        self.inner.providers.read().get(backend_id).cloned()
    }

    pub fn backends(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.providers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.inner.correlator
    }

    pub fn transcript(&self) -> &Arc<Transcript> {
        self.inner.correlator.transcript()
    }

    fn require(&self, backend_id: &str) -> Result<Arc<dyn Provider>, BackendError> {
        self.provider(backend_id)
            .ok_or_else(|| BackendError::InvalidRequest(format!("unknown backend: {backend_id}")))
    }

    /// Configure a backend on the blocking pool, then fetch its catalog.
    ///
    /// Emits [`StreamEvent::Configured`] whether or not it succeeds.
    pub async fn configure_backend(&self, backend_id: &str, config: BackendConfig) -> Result<(), BackendError> {
        let model = config.model_id.trim().to_string();
        let result = self.try_configure(backend_id, config).await;
        let (ok, models) = match &result {
            Ok(models) => (true, models.clone()),
            Err(e) => {
                tracing::error!(backend = backend_id, model = %model, "configure failed: {e}");
                (false, Vec::new())
            }
        };
        self.inner.emit(StreamEvent::Configured {
            backend: backend_id.to_string(),
            model,
            ok,
            models,
        });
        result.map(|_| ())
    }

    async fn try_configure(&self, backend_id: &str, config: BackendConfig) -> Result<Vec<String>, BackendError> {
        let provider = self.require(backend_id)?;
        if self.inner.running.lock().keys().any(|(b, _)| b == backend_id) {
            tracing::warn!(backend = backend_id, "reconfiguring while requests are in flight");
        }
        self.inner.configs.write().remove(backend_id);

        let p = provider.clone();
        let attempt = config.clone();
        if !offload("configure", move || Ok(p.configure(attempt))).await? {
            let reason = provider
                .last_error()
                .unwrap_or_else(|| format!("{backend_id} configuration failed"));
            return Err(BackendError::NotConfigured(reason));
        }
        self.inner.configs.write().insert(backend_id.to_string(), config);

        let p = provider.clone();
        let models = match offload("models", move || Ok(p.available_models())).await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(backend = backend_id, "model catalog unavailable: {e}");
                Vec::new()
            }
        };
        tracing::info!(backend = backend_id, models = models.len(), "backend configured");
        Ok(models)
    }

    /// Model of the last successful configure, trimmed.
    pub fn configured_model(&self, backend_id: &str) -> Option<String> {
        self.inner
            .configs
            .read()
            .get(backend_id)
            .map(|c| c.model_id.trim().to_string())
    }

    /// System prompt of the last successful configure; `None` when blank.
    pub fn system_prompt(&self, backend_id: &str) -> Option<String> {
        self.inner.configs.read().get(backend_id).and_then(BackendConfig::system_prompt)
    }

    pub fn last_error(&self, backend_id: &str) -> Option<String> {
        self.provider(backend_id).and_then(|p| p.last_error())
    }

    /// Model catalog of a backend, fetched on the blocking pool.
    pub async fn available_models(&self, backend_id: &str) -> Result<Vec<String>, BackendError> {
        let provider = self.require(backend_id)?;
        let p = provider.clone();
        let models = offload("models", move || Ok(p.available_models())).await?;
        match provider.last_error() {
            Some(err) if models.is_empty() => Err(BackendError::ProviderUnavailable(err)),
            _ => Ok(models),
        }
    }

    /// Start generating a reply for `request_id`.
    ///
    /// Returns `false` when the request was rejected; an `Error` event has
    /// then been emitted. A duplicate of a request still in flight is rejected
    /// without touching the running one. Must be called inside a Tokio runtime.
    pub fn request_response(
        &self,
        backend_id: &str,
        request_id: &str,
        history: Vec<ChatMessage>,
        options: Options,
    ) -> bool {
        let key = (backend_id.to_string(), request_id.to_string());
        if self.inner.running.lock().contains_key(&key) {
            tracing::warn!(backend = backend_id, request_id, "duplicate request ignored");
            self.inner.emit(StreamEvent::Error {
                backend: backend_id.to_string(),
                request_id: request_id.to_string(),
                message: format!("request {request_id} is already in progress"),
            });
            return false;
        }
        if !self.inner.correlator.register(request_id, backend_id) {
            let owner = self.inner.correlator.backend(request_id).unwrap_or_default();
            self.inner.emit(StreamEvent::Error {
                backend: backend_id.to_string(),
                request_id: request_id.to_string(),
                message: format!("request {request_id} is already in progress on backend '{owner}'"),
            });
            return false;
        }

        let provider = match self.require(backend_id) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(backend = backend_id, request_id, "{e}");
                self.inner.fail(backend_id, request_id, e.to_string());
                return false;
            }
        };
        if !provider.is_configured() {
            let message = format!("backend '{backend_id}' is not configured");
            tracing::error!(backend = backend_id, request_id, "{message}");
            self.inner.fail(backend_id, request_id, message);
            return false;
        }

        let token = CancellationToken::new();
        let now_running = {
            let mut running = self.inner.running.lock();
            running.insert(key.clone(), token.clone());
            running.len()
        };
        self.inner.running_count.send_replace(now_running);
        if now_running == 1 {
            self.inner.emit(StreamEvent::Busy(true));
        }

        tracing::info!(backend = backend_id, request_id, history = history.len(), "dispatching request");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_request(&inner, &key, provider, history, options, token).await;
            inner.finish_task(&key);
        });
        true
    }

    /// Cancel one request. Returns whether it was running.
    pub fn cancel(&self, backend_id: &str, request_id: &str) -> bool {
        let key = (backend_id.to_string(), request_id.to_string());
        match self.inner.running.lock().get(&key) {
            Some(token) => {
                tracing::info!(backend = backend_id, request_id, "cancelling request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every request on `backend_id`. Returns how many were signalled.
    pub fn cancel_backend(&self, backend_id: &str) -> usize {
        let running = self.inner.running.lock();
        let mut n = 0;
        for ((b, _), token) in running.iter() {
            if b == backend_id {
                token.cancel();
                n += 1;
            }
        }
        tracing::info!(backend = backend_id, cancelled = n, "cancelling backend requests");
        n
    }

    pub fn cancel_all(&self) -> usize {
        let running = self.inner.running.lock();
        for token in running.values() {
            token.cancel();
        }
        tracing::info!(cancelled = running.len(), "cancelling all requests");
        running.len()
    }

    pub fn is_busy(&self) -> bool {
        !self.inner.running.lock().is_empty()
    }

    /// Resolve once no request is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.running_count.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

enum Outcome {
    Done(String, Option<TokenUsage>),
    Failed(BackendError),
    Cancelled,
}

async fn run_request(
    inner: &Inner,
    key: &RequestKey,
    provider: Arc<dyn Provider>,
    history: Vec<ChatMessage>,
    options: Options,
    token: CancellationToken,
) {
    let (backend, request_id) = key;
    inner.correlator.notify_started(request_id);
    inner.emit(StreamEvent::Started {
        backend: backend.clone(),
        request_id: request_id.clone(),
    });

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Outcome::Cancelled,
        res = drive(inner, key, provider.as_ref(), &history, &options) => match res {
            Ok((text, usage)) => Outcome::Done(text, usage),
            Err(e) => Outcome::Failed(e),
        },
    };

    match outcome {
        Outcome::Done(text, usage) => {
            let text = if text.trim().is_empty() {
                tracing::warn!(backend = %backend, request_id = %request_id, "empty response");
                EMPTY_RESPONSE.to_string()
            } else {
                text
            };
            let message = ChatMessage::assistant(text).with_id(request_id.clone());
            tracing::info!(backend = %backend, request_id = %request_id, ?usage, "request finished");
            inner.correlator.notify_finished(request_id, &message, usage);
            inner.emit(StreamEvent::Finished {
                backend: backend.clone(),
                request_id: request_id.clone(),
                message,
                usage,
            });
        }
        Outcome::Failed(e) => {
            let message = e.to_string();
            tracing::error!(backend = %backend, request_id = %request_id, kind = %e.kind(), "request failed: {message}");
            inner.fail(backend, request_id, message);
        }
        Outcome::Cancelled => {
            tracing::info!(backend = %backend, request_id = %request_id, "request cancelled");
            inner.fail(backend, request_id, CANCELLED.to_string());
        }
    }
}

/// Open the stream and forward chunks until it ends. Returns the full text
/// and the usage this stream reported.
async fn drive(
    inner: &Inner,
    key: &RequestKey,
    provider: &dyn Provider,
    history: &[ChatMessage],
    options: &Options,
) -> Result<(String, Option<TokenUsage>), BackendError> {
    let (backend, request_id) = key;
    let mut stream = provider.response_stream(history, options).await?;
    let mut full = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.text.is_empty() {
            continue;
        }
        full.push_str(&chunk.text);
        inner.correlator.notify_chunk(request_id, &chunk.text);
        inner.emit(StreamEvent::Chunk {
            backend: backend.clone(),
            request_id: request_id.clone(),
            text: chunk.text,
        });
    }
    Ok((full, stream.usage()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::LoadingState;
    use crate::provider::StubProvider;

    fn coordinator(stub: StubProvider) -> Coordinator {
        let c = Coordinator::new(Arc::new(Transcript::new()));
        c.register("stub", Arc::new(stub));
        c
    }

    async fn drain(rx: &mut broadcast::Receiver<StreamEvent>, request_id: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        loop {
            let ev = rx.recv().await.unwrap();
            if ev.request_id() != Some(request_id) {
                continue;
            }
            let last = matches!(ev, StreamEvent::Finished { .. } | StreamEvent::Error { .. });
            out.push(ev);
            if last {
                return out;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unconfigured_backend_is_rejected_with_error_event() {
        let c = coordinator(StubProvider::new());
        let mut rx = c.subscribe();
        c.transcript().push(ChatMessage::placeholder("r1"));
        assert!(!c.request_response("stub", "r1", vec![ChatMessage::user("hi")], Options::default()));
        let events = drain(&mut rx, "r1").await;
        assert!(matches!(&events[0], StreamEvent::Error { message, .. } if message.contains("not configured")));
        assert_eq!(c.correlator().state("r1"), Some(LoadingState::Error));
        assert!(!c.is_busy());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_reply_gets_placeholder_text() {
        let c = coordinator(StubProvider::new().with_chunks(["", " "]));
        c.configure_backend("stub", BackendConfig::new("m")).await.unwrap();
        let mut rx = c.subscribe();
        c.transcript().push(ChatMessage::placeholder("r1"));
        assert!(c.request_response("stub", "r1", vec![ChatMessage::user("hi")], Options::default()));
        let events = drain(&mut rx, "r1").await;
        match events.last().unwrap() {
            StreamEvent::Finished { message, .. } => assert_eq!(message.text(), EMPTY_RESPONSE),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_backend_fails_configure() {
        let c = coordinator(StubProvider::new());
        let err = c.configure_backend("nope", BackendConfig::new("m")).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
        let err = c.configure_backend("stub", BackendConfig::new("")).await.unwrap_err();
        assert!(matches!(err, BackendError::NotConfigured(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconfigure_failure_forgets_previous_settings() {
        let c = coordinator(StubProvider::new());
        c.configure_backend("stub", BackendConfig::new(" m1 ").with_system_prompt("be brief"))
            .await
            .unwrap();
        assert_eq!(c.configured_model("stub").as_deref(), Some("m1"));
        assert_eq!(c.system_prompt("stub").as_deref(), Some("be brief"));
        assert_eq!(c.last_error("stub"), None);

        assert!(c.configure_backend("stub", BackendConfig::new("")).await.is_err());
        assert_eq!(c.configured_model("stub"), None);
        assert_eq!(c.system_prompt("stub"), None);
        assert!(c.last_error("stub").is_some());
    }
}
