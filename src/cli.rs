// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

/// `relay` — a demo CLI driving the Agent Loop Core over stdio.
///
/// This binary exists to exercise `relay-core`/`relay-config`/`relay-tools`
/// end to end with a deterministic mock model; real transports (chat bot,
/// HTTP, RPC server) and real model providers are external collaborators
/// outside this crate's scope and are expected to construct `relay_core::Agent`
/// the same way `run_once` below does.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Agent Loop Core demo CLI")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). Logs go to stderr.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Explicit config file path; otherwise the usual search path is used.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one turn against a message passed on the command line (or stdin
    /// if omitted), streaming agent events to stdout as they occur.
    Run {
        /// The user message. Reads stdin to EOF if not given.
        message: Option<String>,
        /// Override the system prompt used for this run.
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// Print the fully-resolved configuration as YAML and exit.
    ShowConfig,
    /// Print a shell completion script for the given shell.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}
