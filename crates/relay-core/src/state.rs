// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Run lifecycle state machine.
//!
//! A [`Run`](crate::agent::Agent) owns exactly one [`StateMachine`], which
//! tracks the discrete lifecycle defined by [`RunState`] and rejects any
//! transition outside the allowed table.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Discrete lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Streaming,
    ToolExec,
    Compacting,
    Retrying,
    Complete,
    Error,
    Aborted,
}

impl RunState {
    /// `true` for states with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Error | RunState::Aborted)
    }

    /// Whether moving from `self` to `next` is an allowed transition.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match self {
            Idle => matches!(next, Streaming),
            Streaming => matches!(next, ToolExec | Compacting | Retrying | Complete | Error | Aborted),
            ToolExec => matches!(next, Streaming | Compacting | Error | Aborted),
            Compacting => matches!(next, Streaming | Error | Aborted),
            Retrying => matches!(next, Streaming | Error | Aborted),
            Complete | Error | Aborted => false,
        }
    }
}

/// Point-in-time telemetry for a run, refreshed on every `step_done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: RunState,
    pub step: u32,
    pub tokens_used: usize,
    pub tools_executed: u32,
    pub retry_count: u32,
    pub error_count: u32,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    pub model: String,
    pub last_tool: Option<String>,
}

/// Validating wrapper around [`RunState`]. All mutation goes through
/// [`StateMachine::transition`], which rejects an illegal transition by
/// returning `false` and leaving the state unchanged, so a caller can treat
/// it as a controller bug without the whole run unwinding.
#[derive(Debug)]
pub struct StateMachine {
    state: RunState,
    started_at: Instant,
    step: u32,
    tokens_used_total: usize,
    tools_executed: u32,
    retry_count: u32,
    error_count: u32,
    last_tool: Option<String>,
    model: String,
}

impl StateMachine {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            state: RunState::Idle,
            started_at: Instant::now(),
            step: 0,
            tokens_used_total: 0,
            tools_executed: 0,
            retry_count: 0,
            error_count: 0,
            last_tool: None,
            model: model.into(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Move to `next`. Returns `false` (and leaves the state unchanged) when
    /// the transition is not allowed by [`RunState::can_transition_to`].
    pub fn transition(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    pub fn record_tool_call(&mut self, name: &str) {
        self.tools_executed += 1;
        self.last_tool = Some(name.to_string());
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn add_tokens(&mut self, n: usize) {
        self.tokens_used_total += n;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state,
            step: self.step,
            tokens_used: self.tokens_used_total,
            tools_executed: self.tools_executed,
            retry_count: self.retry_count,
            error_count: self.error_count,
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
            model: self.model.clone(),
            last_tool: self.last_tool.clone(),
        }
    }
}
