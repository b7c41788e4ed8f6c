// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::io::{self, Read};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use relay_core::{Agent, AgentEvent, AgentRuntimeContext, PolicyHook};
use relay_model::MockProvider;
use relay_tools::{FsTool, ReadImageTool, ShellTool, ToolPolicy, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(shell);
            Ok(())
        }
        Some(Commands::ShowConfig) => {
            let config = relay_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Some(Commands::Run { message, system_prompt }) => {
            let config = relay_config::load(cli.config.as_deref())?;
            let message = match message {
                Some(m) => m,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            run_once(&config, system_prompt, message).await
        }
        None => {
            anyhow::bail!("no subcommand given; try `relay run <message>` or `relay --help`")
        }
    }
}

/// Build an [`Agent`] wired up with the built-in reference tools
/// (`shell`, `fs`, `read_image`) and a [`relay_model::MockProvider`], then
/// drive one turn to completion, printing every [`AgentEvent`] as it arrives.
///
/// A real deployment swaps `MockProvider` for a concrete `ModelProvider`
/// implementation and threads a `relay_core::CancelToken` from a
/// `relay_gateway::CancellationRegistry` instead of a fresh one per call —
/// both are external collaborators this demo binary does not depend on.
async fn run_once(
    config: &relay_config::Config,
    system_prompt: Option<String>,
    message: String,
) -> anyhow::Result<()> {
    let mut registry = ToolRegistry::new();
    registry.register(ShellTool { timeout_secs: config.agent.tool_timeout_secs });
    registry.register(FsTool);
    registry.register(ReadImageTool);
    let tools = Arc::new(registry);

    let policy = ToolPolicy::from_config(&config.tools);
    let mut hooks = relay_core::HookChain::new();
    hooks.push(Box::new(PolicyHook::new(policy)));

    let model: Arc<dyn relay_model::ModelProvider> = Arc::new(MockProvider);
    let agent = Agent::new(model, tools, Arc::new(config.agent.clone()), AgentRuntimeContext::default())
        .with_hooks(hooks);

    let system_prompt = system_prompt
        .or_else(|| config.agent.system_prompt.clone())
        .unwrap_or_default();

    let cancel = relay_core::CancelToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_cancel.cancel();
    });

    let (handle, mut events) = agent.run(cancel, system_prompt, message, Vec::new(), None);

    while let Some(event) = events.recv().await {
        print_event(&event);
    }

    let result = handle.join().await;
    if let Some(err) = result.error {
        anyhow::bail!(err);
    }
    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::TextDelta { text, .. } => print!("{text}"),
        AgentEvent::ToolCall { call, .. } => {
            eprintln!("\n[tool_call] {} {}", call.name, call.args);
        }
        AgentEvent::ToolResult { call_id, output, .. } => {
            eprintln!(
                "[tool_result] {call_id} ({}): {}",
                if output.is_error { "error" } else { "ok" },
                truncate_for_log(&output.content)
            );
        }
        AgentEvent::StepDone { snapshot, compacted } => {
            eprintln!(
                "[step_done] step={} tokens_used={} compacted={compacted}",
                snapshot.step, snapshot.tokens_used
            );
        }
        AgentEvent::Error { message } => {
            eprintln!("\n[error] {message}");
        }
        AgentEvent::Done { interrupted, .. } => {
            println!();
            if *interrupted {
                eprintln!("[done] interrupted");
            }
        }
    }
}

fn truncate_for_log(s: &str) -> String {
    const MAX: usize = 200;
    if s.len() <= MAX {
        s.to_string()
    } else {
        format!("{}… ({} bytes total)", &s[..MAX], s.len())
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
