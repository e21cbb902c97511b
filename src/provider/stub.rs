use super::state::ProviderState;
use super::types::merge_catalog;
use super::{BackendConfig, ChatChunk, Options, Provider, StreamFuture};
use crate::error::BackendError;
use crate::message::{ChatMessage, Role, TokenUsage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

struct Session {
    model: String,
}

/// Offline backend that drips scripted chunks.
///
/// With no script it echoes the last user turn. Tests use the builders to
/// inject failures, content blocks and usage figures.
#[derive(Default)]
pub struct StubProvider {
    chunks: Vec<String>,
    delay: Duration,
    fail_after: Option<(usize, BackendError)>,
    block_after: Option<usize>,
    usage: Option<TokenUsage>,
    catalog: Vec<String>,
    state: ProviderState<Session>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            catalog: vec!["stub-echo".to_string()],
            ..Default::default()
        }
    }

    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Pause before each chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Raise `err` in place of chunk `index`.
    pub fn failing_after(mut self, index: usize, err: BackendError) -> Self {
        self.fail_after = Some((index, err));
        self
    }

    /// Emit a content-block notice in place of chunk `index`, then end cleanly.
    pub fn blocking_after(mut self, index: usize) -> Self {
        self.block_after = Some(index);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_catalog<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.catalog = models.into_iter().map(Into::into).collect();
        self
    }

    fn script_for(&self, session: &Session, history: &[ChatMessage]) -> Result<Vec<String>, BackendError> {
        let last_user = history
            .iter()
            .rev()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .find(|m| !m.text().trim().is_empty() || m.has_images())
            .ok_or_else(|| BackendError::InvalidRequest("cannot send request: no sendable messages in history".into()))?;

        if !self.chunks.is_empty() {
            return Ok(self.chunks.clone());
        }
        Ok(vec![
            format!("[stub {}] ", session.model),
            "You said: ".to_string(),
            last_user.text().trim().to_string(),
        ])
    }
}

impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn configure(&self, config: BackendConfig) -> bool {
        self.state.reset();
        let model = config.model_id.trim();
        if model.is_empty() {
            return self
                .state
                .fail_configure(BackendError::InvalidRequest("model ID is required for configuration".into()));
        }
        tracing::info!(model, "stub provider configured");
        self.state.install(Session {
            model: model.to_string(),
        });
        true
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    fn last_error(&self) -> Option<String> {
        self.state.status().last_error()
    }

    fn response_stream(&self, history: &[ChatMessage], _options: &Options) -> StreamFuture {
        let prepared = self.state.begin_stream().and_then(|(session, status)| {
            let parts = self.script_for(&session, history).map_err(|e| status.record(e))?;
            Ok((parts, status))
        });
        let delay = self.delay;
        let fail_after = self.fail_after.clone();
        let block_after = self.block_after;
        let usage = self.usage;

        Box::pin(async move {
            let (parts, status) = prepared?;
            let reply = status.clone();
            let (tx, rx) = mpsc::channel::<Result<ChatChunk, BackendError>>(1);

            tokio::spawn(async move {
                for i in 0..=parts.len() {
                    if block_after == Some(i) {
                        let msg = "Content blocked by API safety filters: SAFETY.";
                        status.set_error(msg);
                        let _ = tx.send(Ok(ChatChunk::system_error(msg))).await;
                        return;
                    }
                    if let Some((_, err)) = fail_after.as_ref().filter(|(at, _)| *at == i) {
                        let _ = tx.send(Err(status.record(err.clone()))).await;
                        return;
                    }
                    let Some(part) = parts.get(i) else { break };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if tx.send(Ok(ChatChunk::new(part.as_str()))).await.is_err() {
                        return;
                    }
                }
                // Still holding `tx`, so usage lands before the consumer sees the end.
                status.set_usage(usage);
            });

            Ok(reply.wrap(ReceiverStream::new(rx)))
        })
    }

    fn available_models(&self) -> Vec<String> {
        let status = self.state.status();
        status.clear_error();
        let configured = self.state.current();
        merge_catalog(self.catalog.clone(), configured.as_ref().map(|s| s.model.as_str()))
    }

    fn last_token_usage(&self) -> Option<TokenUsage> {
        self.state.status().last_usage()
    }
}
