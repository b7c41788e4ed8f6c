// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ordered stages that observe and adjust a step's request and response.
//!
//! Stages run `before_model` in registration order and `after_model` in
//! reverse order, so the first stage registered wraps every other stage —
//! the same nesting discipline as a middleware stack in an HTTP server.

use relay_model::{CompletionResponse, Message, MessageContent};

/// A single pipeline stage. Both hooks default to a no-op so a stage only
/// needs to implement the one it cares about.
pub trait Middleware: Send + Sync {
    /// Mutate the outgoing message list before it is sent to the model.
    fn before_model(&self, _messages: &mut Vec<Message>, _step: u32) {}
    /// Mutate the accumulated response after the model call returns.
    fn after_model(&self, _response: &mut CompletionResponse, _step: u32) {}
}

/// Ordered collection of [`Middleware`] stages.
#[derive(Default)]
pub struct MiddlewarePipeline {
    stages: Vec<Box<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, stage: Box<dyn Middleware>) {
        self.stages.push(stage);
    }

    pub fn run_before_model(&self, messages: &mut Vec<Message>, step: u32) {
        for stage in &self.stages {
            stage.before_model(messages, step);
        }
    }

    pub fn run_after_model(&self, response: &mut CompletionResponse, step: u32) {
        for stage in self.stages.iter().rev() {
            stage.after_model(response, step);
        }
    }
}

/// How an orphaned tool call (no matching tool result) is repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairPolicy {
    /// Remove the dangling tool-call message entirely.
    Drop,
    /// Insert a synthetic `[skipped]` tool-result message right after it, so
    /// providers that require every tool_call to have a matching result
    /// still accept the conversation.
    #[default]
    Synthetic,
}

/// Built-in stage that repairs orphaned tool-call/tool-result pairs and
/// enforces strict role alternation before every model call.
pub struct ToolPairingRepair {
    policy: RepairPolicy,
}

impl ToolPairingRepair {
    pub fn new(policy: RepairPolicy) -> Self {
        Self { policy }
    }
}

impl Middleware for ToolPairingRepair {
    fn before_model(&self, messages: &mut Vec<Message>, _step: u32) {
        repair_tool_pairing(messages, self.policy);
        enforce_turn_ordering(messages);
    }
}

/// Find every `ToolCall` message whose `tool_call_id` has no matching
/// `ToolResult` message anywhere in `messages`, and repair it per `policy`.
/// Returns the number of orphans repaired.
///
/// Repairs are applied from the highest index down so earlier indices stay
/// valid as messages are removed or inserted.
pub fn repair_tool_pairing(messages: &mut Vec<Message>, policy: RepairPolicy) -> usize {
    use std::collections::{HashMap, HashSet};

    let mut call_indices: HashMap<String, usize> = HashMap::new();
    let mut satisfied: HashSet<String> = HashSet::new();

    for (i, msg) in messages.iter().enumerate() {
        match &msg.content {
            MessageContent::ToolCall { tool_call_id, .. } => {
                call_indices.insert(tool_call_id.clone(), i);
            }
            MessageContent::ToolResult { tool_call_id, .. } => {
                satisfied.insert(tool_call_id.clone());
            }
            _ => {}
        }
    }

    let mut orphans: Vec<(String, usize)> = call_indices
        .into_iter()
        .filter(|(id, _)| !satisfied.contains(id))
        .collect();
    orphans.sort_by_key(|(_, idx)| std::cmp::Reverse(*idx));

    let repairs = orphans.len();
    for (id, idx) in orphans {
        match policy {
            RepairPolicy::Drop => {
                messages.remove(idx);
            }
            RepairPolicy::Synthetic => {
                messages.insert(idx + 1, Message::tool_result(id, "[skipped]"));
            }
        }
    }
    repairs
}

/// Merge adjacent plain-text messages that share the same role into one,
/// so the conversation presents strict role alternation to providers that
/// require it (e.g. two consecutive user turns collapse into one).
pub fn enforce_turn_ordering(messages: &mut Vec<Message>) {
    let old = std::mem::take(messages);
    let mut merged: Vec<Message> = Vec::with_capacity(old.len());

    for msg in old {
        if let Some(last) = merged.last_mut() {
            if last.role == msg.role {
                if let (MessageContent::Text(existing), MessageContent::Text(new_text)) =
                    (&mut last.content, &msg.content)
                {
                    existing.push('\n');
                    existing.push_str(new_text);
                    continue;
                }
            }
        }
        merged.push(msg);
    }

    *messages = merged;
}
