// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded-concurrency tool dispatch.
//!
//! Wraps a [`ToolRegistry`] with everything the agent loop controller needs
//! around a raw `execute()` call: a concurrency cap, a per-tool timeout, a
//! short-lived result cache, and a veto hook. The registry itself stays
//! transport- and policy-agnostic.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::{Mutex, Semaphore};

use relay_tools::{ToolCall, ToolOutput, ToolRegistry};

use crate::cancel::CancelToken;
use crate::loop_detector::canonical_fingerprint;

/// Maps a process exit code to a short, model-readable interpretation.
/// Tools that wrap a subprocess use this to make failures legible instead of
/// surfacing a bare numeric code.
pub fn interpret_exit_code(code: i32) -> &'static str {
    match code {
        0 => "success",
        1 => "generic error",
        2 => "usage error",
        124 => "timed out",
        126 => "permission denied",
        127 => "command not found",
        130 => "interrupted (ctrl-c)",
        137 => "killed (out of memory)",
        139 => "segmentation fault",
        143 => "terminated (SIGTERM)",
        255 => "ssh/remote command failure",
        _ => "unknown exit status",
    }
}

/// Build the `[TOOL_FAILED] name\n[ERROR] msg\n[HINT] hint` output synthesized
/// for a failure originating in the fan-out layer itself (timeout, veto,
/// cancellation, unknown tool) rather than the tool's own business logic —
/// distinct from a tool returning `success=false` with its own message.
fn tool_layer_failure(name: &str, error: impl std::fmt::Display, hint: &str) -> String {
    format!("[TOOL_FAILED] {name}\n[ERROR] {error}\n[HINT] {hint}")
}

/// Append a human-readable interpretation of `metadata.exit_code`, if
/// present, so the model sees "exit 137 (killed (out of memory))" instead of
/// a bare number it has to guess the meaning of.
fn annotate_exit_code(output: ToolOutput) -> ToolOutput {
    let Some(code) = output.exit_code() else {
        return output;
    };
    let meaning = interpret_exit_code(code);
    let content = format!("{}\n[exit {code}: {meaning}]", output.content);
    ToolOutput {
        content: content.clone(),
        parts: vec![relay_tools::ToolOutputPart::Text(content)],
        ..output
    }
}

#[derive(Clone)]
struct CacheEntry {
    output: ToolOutput,
    inserted_at: Instant,
}

/// Dispatches tool calls with bounded concurrency, a per-call timeout, and a
/// short-TTL result cache keyed by `(name, canonical_args)`.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    cache_ttl: Duration,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, max_parallel: usize, timeout: Duration) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            timeout,
            cache_ttl: Duration::from_secs(30),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap())),
        }
    }

    /// Drop every cached result. Called once at the start of a run so stale
    /// results from a previous run never leak in.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    fn cache_key(call: &ToolCall) -> String {
        format!("{}::{}", call.name, canonical_fingerprint(&call.args))
    }

    /// Execute a single call, respecting the concurrency cap, timeout, and
    /// cache. Returns `Err(())` if `cancel` fires while waiting for a
    /// concurrency slot, or while the call itself is in flight — either way
    /// the caller should treat this as an aborted run, not a tool failure.
    pub async fn execute(&self, call: ToolCall, cancel: &CancelToken) -> Result<ToolOutput, ()> {
        let key = Self::cache_key(&call);
        if let Some(entry) = self.cache.lock().await.get(&key) {
            if entry.inserted_at.elapsed() < self.cache_ttl {
                return Ok(entry.output.clone());
            }
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(()),
            permit = self.semaphore.clone().acquire_owned() => permit,
        };
        let permit = permit.expect("semaphore is never closed");

        let registry = self.registry.clone();
        let call_for_exec = call.clone();
        let cancel_for_exec = cancel.clone();
        let fut = async move { registry.execute(&call_for_exec, &cancel_for_exec).await };

        // Race the in-flight call against cancellation as well as the
        // timeout: a tool that does not cooperatively honor `cancel` is
        // abandoned here rather than left to run to completion.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(()),
            result = tokio::time::timeout(self.timeout, fut) => match result {
                Ok(out) => annotate_exit_code(out),
                Err(_) => ToolOutput::err(
                    &call.id,
                    tool_layer_failure(
                        &call.name,
                        format!("timed out after {:?}", self.timeout),
                        "increase `tool_timeout` or have the model break the task into smaller steps",
                    ),
                ),
            },
        };
        drop(permit);

        if !output.is_error {
            self.cache.lock().await.put(
                key,
                CacheEntry {
                    output: output.clone(),
                    inserted_at: Instant::now(),
                },
            );
        }

        Ok(output)
    }

    /// Build the synthetic result returned for a call a hook vetoed.
    pub fn blocked_result(call: &ToolCall) -> ToolOutput {
        ToolOutput::err(
            &call.id,
            format!("tool '{}' blocked by security policy", call.name),
        )
    }

    /// Current number of permits available, for tests that assert the
    /// concurrency cap is actually enforced.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
