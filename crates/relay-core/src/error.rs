// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Top-level error type surfaced by a run.
//!
//! Distinct from [`relay_model::ModelError`], which only classifies a single
//! LLM call: `AgentError` covers everything that can end a run, including
//! cancellation, policy vetoes, and tool failures the controller decided not
//! to recover from.

use relay_model::ModelError;

/// Terminal failure of a [`crate::agent::Agent`] run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The caller cancelled the run via its cancel token.
    #[error("run cancelled")]
    Cancelled,

    /// A transient provider error survived all retry attempts.
    #[error("llm call failed after retries: {0}")]
    LlmTransient(String),

    /// A non-retryable provider error (auth, invalid request, etc).
    #[error("llm call failed: {0}")]
    LlmFatal(String),

    /// The context window was exceeded and reactive compaction could not
    /// bring the conversation back under budget within the retry limit.
    #[error("context window exceeded after {attempts} compaction attempts: {message}")]
    LlmContextOverflow { attempts: u32, message: String },

    /// A tool execution failed in a way the controller treated as fatal
    /// (rather than reporting the failure back to the model as a tool
    /// result and continuing).
    #[error("tool '{tool}' failed: {message}")]
    ToolFailure { tool: String, message: String },

    /// A hook's `before_tool_call` veto blocked every tool call in a step,
    /// leaving the run with no way to make progress.
    #[error("blocked by policy: {0}")]
    PolicyVeto(String),

    /// Any other unexpected failure, wrapped with context.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ModelError> for AgentError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Transient(msg) => AgentError::LlmTransient(msg),
            ModelError::Fatal(msg) => AgentError::LlmFatal(msg),
            ModelError::ContextOverflow { message, .. } => AgentError::LlmContextOverflow {
                attempts: 0,
                message,
            },
        }
    }
}

impl AgentError {
    /// `true` if this failure ended the run due to an explicit cancellation
    /// rather than an internal fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}
