// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System-prompt assembly.
//!
//! Building the full prompt shown to an external model (skills catalogs,
//! knowledge-base summaries, sub-agent rosters, slash-command discovery) is a
//! transport/collaborator concern outside the agent loop core. This module
//! only assembles the minimal, stable instruction set the core itself relies
//! on — tool-usage discipline and the volatile git/CI context block — plus
//! the [`relay_config::PromptStyle`] hint a resolved [`relay_config::ModelPolicy`]
//! may request.

use std::path::Path;

use relay_config::PromptStyle;

/// All optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes on every commit
    /// and with every file edit (dirty count). When prompt caching is enabled
    /// this content is placed in a separate, uncached system block so that
    /// the stable prefix remains cacheable across turns.
    pub git_context: Option<&'a str>,
    /// Contents of a project context file (`AGENTS.md`, `CLAUDE.md`, …).
    pub project_context_file: Option<&'a str>,
    /// Pre-formatted CI environment block.
    ///
    /// **Caching note**: like `git_context`, this is volatile between CI runs.
    pub ci_context: Option<&'a str>,
    /// Text appended verbatim after the built-in guidelines.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// Return a version of this context with the volatile fields cleared.
    /// Used to build the stable (cacheable) portion of the system prompt.
    pub fn stable_only(&self) -> Self {
        Self {
            project_root: self.project_root,
            git_context: None,
            project_context_file: self.project_context_file,
            ci_context: None,
            append: self.append,
        }
    }

    /// Format the volatile fields (git + CI context) as a block suitable for
    /// appending to the system prompt outside the cached region.
    ///
    /// Returns `None` when neither git nor CI context is present.
    pub fn dynamic_block(&self) -> Option<String> {
        let git = self.git_context.filter(|s| !s.trim().is_empty()).map(str::to_string);
        let ci = self.ci_context.filter(|s| !s.trim().is_empty()).map(str::to_string);
        match (git, ci) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (Some(g), Some(c)) => Some(format!("{g}\n\n{c}")),
        }
    }
}

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - State assumptions explicitly when a request is ambiguous."
    }

    pub fn tool_usage() -> &'static str {
        "- Prefer the narrowest tool that answers the question; do not run a broad search when a \
           direct read will do.\n\
         - Batch independent tool calls in parallel rather than issuing them one at a time.\n\
         - If a tool call fails, read the error before retrying — do not repeat an identical call \
           expecting a different result."
    }

    pub fn code_quality() -> &'static str {
        "- Make sure all generated code is production quality and follows the surrounding style.\n\
         - Do not create new files unless explicitly requested.\n\
         - Preserve existing code structure and conventions."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool fails, try a different approach before reporting failure to the user.\n\
         - Never bypass a safety check or force an operation without explicit user permission."
    }
}

fn style_hint(style: PromptStyle) -> Option<&'static str> {
    match style {
        PromptStyle::Default => None,
        PromptStyle::Concise => Some(
            "- Keep responses brief: prefer short sentences and bullet points over prose.",
        ),
        PromptStyle::Structured => Some(
            "- Structure non-trivial responses with headings and numbered steps.",
        ),
    }
}

/// Assemble the full system prompt from the built-in guidelines, an optional
/// model-specific style hint, and the caller-supplied context blocks.
///
/// `ctx.git_context`/`ctx.ci_context` are appended after everything else so
/// a caller can split the result at [`PromptContext::stable_only`]'s output
/// to keep the volatile suffix out of a provider's prompt cache.
pub fn system_prompt(ctx: &PromptContext<'_>, style: PromptStyle) -> String {
    let mut sections = vec![
        "You are an autonomous coding and operations agent. Work methodically, verify your \
         assumptions with tools, and report results plainly."
            .to_string(),
        "## Guidelines".to_string(),
        guidelines::general().to_string(),
        guidelines::tool_usage().to_string(),
        guidelines::code_quality().to_string(),
        guidelines::error_handling().to_string(),
    ];

    if let Some(hint) = style_hint(style) {
        sections.push(hint.to_string());
    }

    if let Some(root) = ctx.project_root {
        sections.push(format!("Project root: {}", root.display()));
    }

    if let Some(file) = ctx.project_context_file {
        if !file.trim().is_empty() {
            sections.push(format!("## Project context\n\n{file}"));
        }
    }

    if let Some(append) = ctx.append {
        if !append.trim().is_empty() {
            sections.push(append.to_string());
        }
    }

    if let Some(dynamic) = ctx.dynamic_block() {
        sections.push(dynamic);
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_prompt_contains_guidelines() {
        let ctx = PromptContext::default();
        let prompt = system_prompt(&ctx, PromptStyle::Default);
        assert!(prompt.contains("## Guidelines"));
        assert!(prompt.contains("Be concise and precise"));
    }

    #[test]
    fn default_style_adds_no_hint() {
        let ctx = PromptContext::default();
        let prompt = system_prompt(&ctx, PromptStyle::Default);
        assert!(!prompt.contains("Keep responses brief"));
    }

    #[test]
    fn concise_style_adds_hint() {
        let ctx = PromptContext::default();
        let prompt = system_prompt(&ctx, PromptStyle::Concise);
        assert!(prompt.contains("Keep responses brief"));
    }

    #[test]
    fn structured_style_adds_hint() {
        let ctx = PromptContext::default();
        let prompt = system_prompt(&ctx, PromptStyle::Structured);
        assert!(prompt.contains("Structure non-trivial responses"));
    }

    #[test]
    fn append_text_is_included() {
        let ctx = PromptContext { append: Some("Extra rule."), ..Default::default() };
        let prompt = system_prompt(&ctx, PromptStyle::Default);
        assert!(prompt.contains("Extra rule."));
    }

    #[test]
    fn dynamic_block_merges_git_and_ci() {
        let ctx = PromptContext {
            git_context: Some("branch: main"),
            ci_context: Some("CI: github-actions"),
            ..Default::default()
        };
        let block = ctx.dynamic_block().unwrap();
        assert!(block.contains("branch: main"));
        assert!(block.contains("CI: github-actions"));
    }

    #[test]
    fn dynamic_block_none_when_empty() {
        let ctx = PromptContext::default();
        assert!(ctx.dynamic_block().is_none());
    }

    #[test]
    fn stable_only_clears_volatile_fields() {
        let ctx = PromptContext {
            git_context: Some("branch: main"),
            ci_context: Some("CI: x"),
            append: Some("keep me"),
            ..Default::default()
        };
        let stable = ctx.stable_only();
        assert!(stable.git_context.is_none());
        assert!(stable.ci_context.is_none());
        assert_eq!(stable.append, Some("keep me"));
    }

    #[test]
    fn project_context_file_is_included_when_present() {
        let ctx = PromptContext { project_context_file: Some("repo conventions here"), ..Default::default() };
        let prompt = system_prompt(&ctx, PromptStyle::Default);
        assert!(prompt.contains("repo conventions here"));
    }
}
