//! One streaming chat-completion contract over Gemini, OpenAI and Ollama.
//!
//! Providers wrap blocking HTTP clients; [`provider::bridge`] turns their
//! iterators into async streams, and [`coordinator::Coordinator`] drives
//! requests, tracking each one through the [`correlator::Correlator`].

pub mod config;
pub mod coordinator;
pub mod correlator;
pub mod error;
pub mod message;
pub mod paths;
pub mod provider;
pub mod transcript;

pub use coordinator::{Coordinator, StreamEvent};
pub use correlator::Correlator;
pub use error::{BackendError, ErrorKind};
pub use message::{ChatMessage, LoadingState, Part, Role, TokenUsage};
pub use provider::{BackendConfig, ChatChunk, Options, Provider};
pub use transcript::Transcript;
