use crate::provider::{google, ollama, openai, BackendConfig, Options};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_BACKEND: &str = "gemini";

const NO_KEYS: &[&str] = &[];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend identifier: gemini, openai, ollama or stub.
    pub backend: Option<String>,

    /// Model for the selected backend.
    pub model: Option<String>,

    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub gemini: KeySection,
    #[serde(default)]
    pub openai: KeySection,
    #[serde(default)]
    pub ollama: OllamaSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeySection {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OllamaSection {
    pub host: Option<String>,
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Everything needed to build, configure and call one backend.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub backend: String,
    pub backend_config: BackendConfig,
    pub options: Options,
    pub ollama_host: Option<String>,
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }

    /// Merge CLI flags, environment, this file and built-in defaults, in that order.
    pub fn resolve(&self, cli: &Overrides) -> anyhow::Result<Resolved> {
        self.resolve_with(cli, |k| std::env::var(k).ok())
    }

    fn resolve_with(&self, cli: &Overrides, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Resolved> {
        let env = |k: &str| var(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = cli
            .backend
            .clone()
            .or_else(|| self.backend.clone())
            .unwrap_or_else(|| DEFAULT_BACKEND.to_string())
            .to_lowercase();

        let (key_vars, file_key): (&[&str], Option<&String>) = match backend.as_str() {
            "gemini" | "google" => (google::API_KEY_VARS, self.gemini.api_key.as_ref()),
            "openai" => (openai::API_KEY_VARS, self.openai.api_key.as_ref()),
            "ollama" | "stub" => (NO_KEYS, None),
            other => anyhow::bail!("unknown backend in configuration: {other}"),
        };
        let credential = key_vars
            .iter()
            .find_map(|k| env(*k))
            .or_else(|| file_key.cloned());

        let model = cli
            .model
            .clone()
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| default_model(&backend).to_string());

        let mut backend_config = BackendConfig::new(model);
        backend_config.credential = credential;
        backend_config.system_prompt = cli.system_prompt.clone().or_else(|| self.system_prompt.clone());

        let ollama_host = env(ollama::HOST_VAR).or_else(|| self.ollama.host.clone());

        Ok(Resolved {
            backend,
            backend_config,
            options: Options {
                temperature: cli.temperature.or(self.temperature),
                max_tokens: cli.max_tokens.or(self.max_tokens),
            },
            ollama_host,
        })
    }
}

pub fn default_model(backend: &str) -> &'static str {
    match backend {
        "openai" => "gpt-4o-mini",
        "ollama" => "llama3",
        "stub" => "stub-echo",
        _ => "gemini-1.5-flash",
    }
}
