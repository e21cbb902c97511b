use chatbridge::config::Overrides;
use clap::{Parser, Subcommand};

/// Stream one chat reply from Gemini, OpenAI, Ollama or the offline stub.
#[derive(Debug, Parser)]
#[command(name = "chatbridge")]
#[command(version)]
#[command(about = "Streaming chat over Gemini, OpenAI and Ollama", long_about = None)]
pub struct Args {
    /// Backend: gemini, openai, ollama or stub (default: config/backend or "gemini")
    #[arg(short = 'b', long = "backend", global = true)]
    pub backend: Option<String>,

    /// Model name
    #[arg(short = 'm', long = "model", global = true)]
    pub model: Option<String>,

    /// System prompt
    #[arg(short = 's', long = "system")]
    pub system: Option<String>,

    /// Sampling temperature, passed through unclamped
    #[arg(short = 't', long = "temperature")]
    pub temperature: Option<f64>,

    /// Completion token limit (OpenAI only)
    #[arg(long = "max-tokens")]
    pub max_tokens: Option<u32>,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional) (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the chat models the backend offers
    Models,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend.clone(),
            model: self.model.clone(),
            system_prompt: self.system.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}
