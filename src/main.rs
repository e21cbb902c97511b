mod cli;

use anyhow::Context;
use chatbridge::config::{self, Resolved};
use chatbridge::{paths, provider, ChatMessage, Coordinator, StreamEvent, Transcript};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so streamed text on stdout stays clean.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = cli::Args::parse();

    let config_path = paths::config_path()?;
    let cfg = config::Config::load_optional(&config_path)?.unwrap_or_default();
    tracing::debug!(?config_path, "resolved config path");

    let resolved = cfg.resolve(&args.overrides())?;
    let coordinator = Coordinator::new(Arc::new(Transcript::new()));
    let backend = resolved.backend.clone();
    let p = provider::build(&backend, resolved.ollama_host.clone())?;
    coordinator.register(backend.clone(), Arc::from(p));

    coordinator
        .configure_backend(&backend, resolved.backend_config.clone())
        .await
        .with_context(|| format!("failed to configure backend '{backend}'"))?;

    if let Some(cli::Command::Models) = args.cmd {
        return cmd_models(&coordinator, &backend).await;
    }

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: chatbridge \"Hello\" or `chatbridge models`");
    }

    cmd_prompt(&coordinator, &resolved, prompt).await
}

async fn cmd_models(coordinator: &Coordinator, backend: &str) -> anyhow::Result<()> {
    let models = coordinator
        .available_models(backend)
        .await
        .with_context(|| format!("failed to list models for '{backend}'"))?;
    let mut out = std::io::stdout().lock();
    for m in models {
        writeln!(out, "{m}").ok();
    }
    Ok(())
}

async fn cmd_prompt(coordinator: &Coordinator, resolved: &Resolved, prompt: String) -> anyhow::Result<()> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let transcript = coordinator.transcript();
    transcript.push(ChatMessage::user(prompt));
    transcript.push(ChatMessage::placeholder(&request_id));
    let history = transcript.history_before(&request_id);

    let mut events = coordinator.subscribe();
    if !coordinator.request_response(&resolved.backend, &request_id, history, resolved.options) {
        let reason = coordinator.correlator().error(&request_id).unwrap_or_default();
        anyhow::bail!("request was rejected: {reason}");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    // What reached stdout so far; after a lag the rest comes from the transcript.
    let mut printed = String::new();
    let mut lagged = false;
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            ev = events.recv() => match ev {
                Ok(ev) => ev,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event receiver lagged; printing the reply from the transcript");
                    lagged = true;
                    continue;
                }
                Err(RecvError::Closed) => anyhow::bail!("event channel closed"),
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                coordinator.cancel_all();
                continue;
            }
        };
        if event.request_id() != Some(request_id.as_str()) {
            continue;
        }
        match event {
            StreamEvent::Chunk { text, .. } => {
                if !lagged {
                    print!("{text}");
                    printed.push_str(&text);
                    std::io::stdout().flush().ok();
                }
            }
            StreamEvent::Finished { message, usage, .. } => {
                let full = transcript
                    .message(&request_id)
                    .map(|m| m.text())
                    .unwrap_or_else(|| message.text());
                match full.strip_prefix(printed.as_str()) {
                    Some(rest) => print!("{rest}"),
                    None => print!("\n{full}"),
                }
                println!();
                if let Some(u) = usage {
                    tracing::info!(prompt_tokens = u.prompt_tokens, completion_tokens = u.completion_tokens, "token usage");
                }
                break;
            }
            StreamEvent::Error { message, .. } => {
                println!();
                anyhow::bail!("{message}");
            }
            StreamEvent::Started { .. } | StreamEvent::Configured { .. } | StreamEvent::Busy(_) => {}
        }
    }

    coordinator.wait_idle().await;
    Ok(())
}
