// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::policy::ApprovalPolicy;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`.  Vision-capable tools (e.g. `read_image`)
/// may produce a mix of `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of executing a tool.
///
/// ## Backward compatibility
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts).  Existing tools and tests that only
/// access `content` continue to work unchanged.
///
/// ## Image support
/// Tools that return images populate `parts` with a mix of [`ToolOutputPart::Text`]
/// and [`ToolOutputPart::Image`] items.  The agent maps these into the
/// appropriate [`relay_model::ToolResultContent`] variant when building the
/// conversation history.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content — concatenation of all Text parts.
    /// Always set; always readable.  Backward-compatible field.
    pub content: String,
    /// Structured parts (text and/or images).  For tools that only return
    /// text this contains exactly one `Text` part mirroring `content`.
    pub parts: Vec<ToolOutputPart>,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
    /// Free-form structured metadata a tool attaches to its result — e.g. a
    /// subprocess-backed tool sets `{"exit_code": <i64>}` so the fan-out layer
    /// can translate the numeric code into a model-readable interpretation.
    pub metadata: Option<Value>,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: false,
            metadata: None,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: true,
            metadata: None,
        }
    }

    /// Result with arbitrary parts (text and/or images).
    ///
    /// `content` is set to the concatenation of all Text parts.
    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            call_id: call_id.into(),
            content: text,
            parts,
            is_error: false,
            metadata: None,
        }
    }

    /// Attach structured metadata (e.g. `{"exit_code": 137}`), returning `self`
    /// for chaining onto `ok`/`err`/`with_parts`.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The `exit_code` field of `metadata`, if present and numeric.
    pub fn exit_code(&self) -> Option<i32> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("exit_code"))
            .and_then(|v| v.as_i64())
            .map(|n| n as i32)
    }

    /// Return `true` if this output contains at least one image part.
    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Classification of what kind of effect a tool has, used by the Agent Loop
/// Core's loop detector (safe-kind tools are exempt) and approval gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Reads existing state without changing it (file read, list, stat).
    Read,
    /// Modifies existing state (file write/append, patch).
    Edit,
    /// Runs an external process or command.
    Execute,
    /// Removes state (file/resource deletion).
    Delete,
    /// Searches or queries without side effects (grep, codebase search).
    Search,
    /// Fetches external content (web search, URL fetch).
    Fetch,
    /// Internal reasoning aid with no external effect (scratchpad, planning).
    Think,
    /// Sends output to a human or external channel (message, notification).
    Communicate,
}

impl ToolKind {
    /// `true` for kinds exempt from loop detection and most approval gates:
    /// read, search, and think never mutate state, so repeating them is not
    /// evidence of a stuck agent.
    pub fn is_safe(&self) -> bool {
        matches!(self, ToolKind::Read | ToolKind::Search | ToolKind::Think)
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, `relay-core` uses
/// this category to pick the right extraction strategy.  Each tool declares
/// its own category; `relay-core` never hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first 60 + last 40 lines so both
    /// the command preamble and the final result are visible.
    /// Suitable for: shell, run_terminal_command, gdb commands.
    HeadTail,
    /// Ordered match list: keep the leading matches so the model sees the
    /// highest-relevance results first.
    /// Suitable for: grep, search_codebase, read_lints.
    MatchList,
    /// File content: keep a head and tail window with a separator so the
    /// model sees both the top of the file (imports, declarations) and the
    /// end (recent changes).
    /// Suitable for: read_file, fs read operations.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    /// Used for all tools that do not fit the categories above.
    #[default]
    Generic,
}

/// Trait that every built-in and user-defined tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Default approval level for this tool
    fn default_policy(&self) -> ApprovalPolicy;
    /// Describes the shape of this tool's output for context-aware truncation.
    ///
    /// Override this when your tool produces output whose leading or trailing
    /// portion is more useful than a hard cut.  The default is
    /// [`OutputCategory::Generic`] (hard truncation).
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Classifies this tool's effect for the loop detector and approval
    /// gates.  Defaults to [`ToolKind::Execute`], the most conservative
    /// classification (never exempted from loop detection).
    fn kind(&self) -> ToolKind {
        ToolKind::Execute
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    ///
    /// `cancel` carries the enclosing run's cancellation signal. Tools whose
    /// work can be meaningfully interrupted (a subprocess, a long poll loop)
    /// should race it with `tokio::select!` and return promptly if it fires;
    /// tools that cannot be interrupted mid-call may ignore it and simply
    /// run to completion or their own timeout.
    async fn execute(&self, call: &ToolCall, cancel: &CancelToken) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
