// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Detects an agent stuck repeating the same tool call, or hammering the
//! same tool name with varying arguments.
//!
//! Two independent signals feed a single reflection prompt queue:
//!
//! - an exact-match sliding window over `(name, canonical_args)` pairs,
//!   firing once a pair recurs `loop_detect_threshold` times inside the
//!   window; the window is cleared on fire so the same pair does not
//!   re-fire every subsequent call.
//! - a consecutive-same-name counter, firing once the same tool name has
//!   been called `loop_name_threshold` times in a row regardless of
//!   arguments.
//!
//! Calls to tools whose [`relay_tools::ToolKind`] is
//! [`is_safe`](relay_tools::ToolKind::is_safe) never participate: reading,
//! searching, and thinking repeatedly is not evidence of a stuck agent.

use std::collections::VecDeque;

use relay_tools::ToolKind;
use serde_json::Value;

/// Serializes `args` with object keys sorted, so two JSON values that
/// differ only in key order produce the same fingerprint.
pub fn canonical_fingerprint(args: &Value) -> String {
    fn canonicalize(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), canonicalize(&map[k]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(args).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CallKey {
    name: String,
    fingerprint: String,
}

/// A reflection prompt to inject into the conversation so the model notices
/// it is repeating itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopSignal {
    /// The exact same call (name + arguments) recurred too many times.
    RepeatedCall { name: String, count: u32 },
    /// The same tool name was called too many times in a row.
    RepeatedName { name: String, count: u32 },
}

impl LoopSignal {
    /// Render as a user-role reminder appended to the conversation.
    pub fn to_prompt(&self) -> String {
        match self {
            LoopSignal::RepeatedCall { name, count } => format!(
                "Notice: the tool `{name}` has been called with identical arguments {count} times. \
                 If the result was not what you needed, try a different approach instead of repeating it."
            ),
            LoopSignal::RepeatedName { name, count } => format!(
                "Notice: the tool `{name}` has been called {count} times in a row. \
                 Consider whether you have enough information to proceed without calling it again."
            ),
        }
    }
}

/// Stateful detector owned by a single run. Not `Clone` — it tracks
/// per-run history and must not be shared across runs.
#[derive(Debug)]
pub struct LoopDetector {
    window: VecDeque<CallKey>,
    window_size: usize,
    repeat_threshold: u32,
    last_name: Option<String>,
    consecutive_name_count: u32,
    name_threshold: u32,
}

impl LoopDetector {
    pub fn new(window_size: usize, repeat_threshold: u32, name_threshold: u32) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            repeat_threshold,
            last_name: None,
            consecutive_name_count: 0,
            name_threshold,
        }
    }

    /// Record a tool call and return any loop signal it triggers. Safe-kind
    /// tools are recorded for the consecutive-name counter reset but never
    /// trigger a signal themselves.
    pub fn observe(&mut self, name: &str, args: &Value, kind: ToolKind) -> Option<LoopSignal> {
        if Some(name) == self.last_name.as_deref() {
            self.consecutive_name_count += 1;
        } else {
            self.last_name = Some(name.to_string());
            self.consecutive_name_count = 1;
        }

        if kind.is_safe() {
            return None;
        }

        if self.consecutive_name_count >= self.name_threshold {
            let count = self.consecutive_name_count;
            self.consecutive_name_count = 0;
            return Some(LoopSignal::RepeatedName {
                name: name.to_string(),
                count,
            });
        }

        let key = CallKey {
            name: name.to_string(),
            fingerprint: canonical_fingerprint(args),
        };

        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(key.clone());

        let occurrences = self.window.iter().filter(|k| **k == key).count() as u32;
        if occurrences >= self.repeat_threshold {
            self.window.clear();
            return Some(LoopSignal::RepeatedCall {
                name: key.name,
                count: occurrences,
            });
        }

        None
    }
}
