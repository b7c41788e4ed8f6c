// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context for an agent run.
//!
//! Separate from [`relay_config::AgentLoopConfig`], which holds only
//! config-file fields. [`AgentRuntimeContext`] carries values detected or
//! supplied at construction time that feed the system prompt but are not
//! themselves configuration: project root, ambient git/CI notes, and prompt
//! overrides. Concrete discovery of these values (walking up to find `.git`,
//! shelling out to `git status`, reading CI environment variables) is a
//! transport/collaborator concern; this type only carries the result.

use std::path::PathBuf;

/// Environment-detected context injected into an agent at construction time.
#[derive(Debug, Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (found via `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Pre-formatted git context block (branch, commit, dirty status).
    pub git_context_note: Option<String>,
    /// Pre-formatted CI environment context block.
    pub ci_context_note: Option<String>,
    /// Contents of a project context file (`AGENTS.md`, `CLAUDE.md`, …).
    pub project_context_file: Option<String>,
    /// Text appended to the default system prompt.
    pub append_system_prompt: Option<String>,
    /// Full system prompt override. When set, replaces
    /// [`relay_config::AgentLoopConfig::system_prompt`] entirely.
    pub system_prompt_override: Option<String>,
}
