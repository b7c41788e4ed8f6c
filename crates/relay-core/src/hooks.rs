// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Observer hooks into the run lifecycle.
//!
//! Unlike [`crate::middleware::Middleware`], which rewrites messages and
//! responses, a hook only observes — with one exception: `before_tool_call`
//! may veto a call outright. Hooks are invoked in registration order; a veto
//! from any hook short-circuits the remaining hooks for that call.

use async_trait::async_trait;

use crate::error::AgentError;
use crate::state::RunState;
use relay_model::{CompletionRequest, CompletionResponse};
use relay_tools::{ApprovalPolicy, ToolCall, ToolOutput, ToolPolicy};

/// Observer hook into the agent loop controller. All methods default to a
/// no-op (or, for `before_tool_call`, to allow) so implementors only need to
/// override what they care about.
#[async_trait]
pub trait AgentHook: Send + Sync {
    async fn before_llm_call(&self, _request: &CompletionRequest, _step: u32) {}
    async fn after_llm_call(&self, _response: &CompletionResponse, _step: u32) {}

    /// Return `false` to veto this call. The controller short-circuits it to
    /// a synthetic "blocked by security policy" result without dispatching
    /// it to the tool registry.
    async fn before_tool_call(&self, _call: &ToolCall) -> bool {
        true
    }

    async fn after_tool_call(&self, _call: &ToolCall, _output: &ToolOutput) {}
    async fn on_error(&self, _error: &AgentError) {}
    async fn on_complete(&self, _final_content: &str) {}
    async fn on_state_change(&self, _from: RunState, _to: RunState) {}
}

/// Ordered collection of [`AgentHook`] implementors.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn AgentHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn push(&mut self, hook: Box<dyn AgentHook>) {
        self.hooks.push(hook);
    }

    pub async fn before_llm_call(&self, request: &CompletionRequest, step: u32) {
        for hook in &self.hooks {
            hook.before_llm_call(request, step).await;
        }
    }

    pub async fn after_llm_call(&self, response: &CompletionResponse, step: u32) {
        for hook in &self.hooks {
            hook.after_llm_call(response, step).await;
        }
    }

    /// Run every hook's veto check in order. Returns `false` as soon as any
    /// hook vetoes, skipping the remainder.
    pub async fn before_tool_call(&self, call: &ToolCall) -> bool {
        for hook in &self.hooks {
            if !hook.before_tool_call(call).await {
                return false;
            }
        }
        true
    }

    pub async fn after_tool_call(&self, call: &ToolCall, output: &ToolOutput) {
        for hook in &self.hooks {
            hook.after_tool_call(call, output).await;
        }
    }

    pub async fn on_error(&self, error: &AgentError) {
        for hook in &self.hooks {
            hook.on_error(error).await;
        }
    }

    pub async fn on_complete(&self, final_content: &str) {
        for hook in &self.hooks {
            hook.on_complete(final_content).await;
        }
    }

    pub async fn on_state_change(&self, from: RunState, to: RunState) {
        for hook in &self.hooks {
            hook.on_state_change(from, to).await;
        }
    }
}

/// Built-in hook that vetoes tool calls denied by a [`ToolPolicy`].
///
/// `Ask`-level decisions are treated as allowed here: a headless agent loop
/// has nowhere to route an interactive approval prompt, so that routing is
/// left to whatever owns the [`ToolPolicy`] (e.g. a transport adapter
/// wrapping this hook with its own UI-backed veto).
pub struct PolicyHook {
    policy: ToolPolicy,
}

impl PolicyHook {
    pub fn new(policy: ToolPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AgentHook for PolicyHook {
    async fn before_tool_call(&self, call: &ToolCall) -> bool {
        let command = call.args.get("command").and_then(|v| v.as_str()).unwrap_or(&call.name);
        !matches!(self.policy.decide(command), ApprovalPolicy::Deny)
    }
}
