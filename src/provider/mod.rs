//! Chat backends behind the [`Provider`] trait.

pub mod bridge;
pub mod google;
mod http;
pub mod ollama;
pub mod openai;
mod sse;
mod state;
pub mod stub;
mod types;

pub use bridge::BlockingIter;
pub use google::GoogleProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use stub::StubProvider;
pub use types::{BackendConfig, ChatChunk, Options, Provider, ResponseStream, StreamFuture};

/// Backend identifiers accepted by [`build`].
pub const BACKENDS: [&str; 4] = ["gemini", "openai", "ollama", "stub"];

/// Construct an unconfigured provider by identifier.
pub fn build(id: &str, ollama_host: Option<String>) -> Result<Box<dyn Provider>, crate::error::BackendError> {
    match id {
        "gemini" | "google" => Ok(Box::new(GoogleProvider::new())),
        "openai" => Ok(Box::new(OpenAiProvider::new())),
        "ollama" => {
            let provider = OllamaProvider::new(ollama_host);
            tracing::debug!(host = provider.host(), "Ollama endpoint resolved");
            Ok(Box::new(provider))
        }
        "stub" => Ok(Box::new(StubProvider::new())),
        other => Err(crate::error::BackendError::InvalidRequest(format!(
            "unknown backend: {other} (expected one of {})",
            BACKENDS.join(", ")
        ))),
    }
}
