// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The event stream emitted by a running [`crate::agent::Agent`].
//!
//! Modeled as a sum type with a payload per case, not a struct with a pile of
//! optional fields — each variant carries exactly what that point in the run
//! can produce. Ordering is a controller invariant, not something encoded in
//! the type: see [`crate::agent::Agent::run`] for the guarantee that every
//! `tool_call` is eventually followed by its matching `tool_result`, that
//! `step_done` precedes the next step's events, and that the stream ends in
//! exactly one `done` or `error`.

use relay_tools::{ToolCall, ToolOutput};

use crate::state::StateSnapshot;

/// One event on a run's output stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A chunk of assistant text streamed in real time. Never scrubbed of
    /// reasoning tags — scrubbing only happens once, on the fully
    /// accumulated turn, after streaming completes.
    TextDelta { step: u32, text: String },

    /// The model requested a tool invocation. Emitted in call order before
    /// dispatch; the matching [`AgentEvent::ToolResult`] always follows,
    /// though other events may interleave between them.
    ToolCall { step: u32, call: ToolCall },

    /// The result of a previously emitted [`AgentEvent::ToolCall`], matched
    /// by `call_id`.
    ToolResult { step: u32, call_id: String, output: ToolOutput },

    /// A step finished: its LLM response has been fully consumed and any
    /// resulting tool calls dispatched. `compacted` is set when this step
    /// triggered a context compaction (pre-call, reactive, or post-tool).
    StepDone { snapshot: StateSnapshot, compacted: bool },

    /// The run ended without producing a usable final result. Always the
    /// last event on the stream when present.
    Error { message: String },

    /// The run completed. Always the last event on the stream when
    /// present. `interrupted` distinguishes a cancelled-but-partial result
    /// from a normal completion.
    Done { final_content: String, interrupted: bool },
}

impl AgentEvent {
    /// `true` for the two variants that may legally end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Error { .. } | AgentEvent::Done { .. })
    }
}
