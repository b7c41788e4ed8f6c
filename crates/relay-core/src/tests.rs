// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests driving [`crate::agent::Agent`] through a real (mocked)
//! model provider and real tool dispatch, exercising the invariants the event
//! stream and run result are supposed to uphold.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use relay_config::AgentLoopConfig;
use relay_model::{CompletionRequest, ModelProvider, ResponseEvent, ScriptedMockProvider};
use relay_tools::{ApprovalPolicy, OutputCategory, Tool, ToolCall, ToolKind, ToolOutput, ToolRegistry};

use crate::agent::Agent;
use crate::cancel::CancelToken;
use crate::events::AgentEvent;
use crate::runtime_context::AgentRuntimeContext;

// ─── Test doubles ───────────────────────────────────────────────────────────

/// Echoes its `value` argument back as the tool result.
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its input"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"value": {"type": "string"}}})
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    async fn execute(&self, call: &ToolCall, _cancel: &CancelToken) -> ToolOutput {
        let value = call.args.get("value").and_then(|v| v.as_str()).unwrap_or("");
        ToolOutput::ok(&call.id, format!("echo:{value}"))
    }
}

/// Sleeps for `delay` while tracking the high-water mark of concurrently
/// executing calls, so tests can assert on the fan-out concurrency cap.
struct ConcurrencyTrackingTool {
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for ConcurrencyTrackingTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "a deliberately slow tool"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    async fn execute(&self, call: &ToolCall, _cancel: &CancelToken) -> ToolOutput {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        ToolOutput::ok(&call.id, "done")
    }
}

/// A tool that sleeps long enough for a test to cancel the run while it is
/// still outstanding.
struct StallingTool {
    delay: Duration,
}

#[async_trait]
impl Tool for StallingTool {
    fn name(&self) -> &str {
        "stall"
    }
    fn description(&self) -> &str {
        "never finishes before the test cancels the run"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    async fn execute(&self, call: &ToolCall, cancel: &CancelToken) -> ToolOutput {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ToolOutput::err(&call.id, "cancelled"),
            _ = tokio::time::sleep(self.delay) => ToolOutput::ok(&call.id, "too late"),
        }
    }
}

type BoxedStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// Returns a context-overflow error from `complete()` the first `fail_times`
/// calls, then succeeds with a plain text reply.
struct FlakyOverflowProvider {
    calls: AtomicU32,
    fail_times: u32,
}

#[async_trait]
impl ModelProvider for FlakyOverflowProvider {
    fn name(&self) -> &str {
        "flaky"
    }
    fn model_name(&self) -> &str {
        "flaky-model"
    }
    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<BoxedStream> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_times {
            return Err(anyhow::anyhow!("maximum context length is 8192 tokens, please shorten your messages"));
        }
        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta("recovered".into())),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Always fails with a fatal (non-retryable) error.
struct AlwaysFatalProvider;

#[async_trait]
impl ModelProvider for AlwaysFatalProvider {
    fn name(&self) -> &str {
        "broken"
    }
    fn model_name(&self) -> &str {
        "broken-model"
    }
    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<BoxedStream> {
        Err(anyhow::anyhow!("401 Unauthorized: invalid API key"))
    }
}

/// Emits `n` tool calls (distinct indices) in a single round, then a plain
/// text reply once any tool result comes back.
struct ParallelCallsProvider {
    n: u32,
}

#[async_trait]
impl ModelProvider for ParallelCallsProvider {
    fn name(&self) -> &str {
        "parallel"
    }
    fn model_name(&self) -> &str {
        "parallel-model"
    }
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<BoxedStream> {
        let has_tool_result = req
            .messages
            .iter()
            .any(|m| matches!(&m.content, relay_model::MessageContent::ToolResult { .. }));
        if has_tool_result {
            let events: Vec<anyhow::Result<ResponseEvent>> =
                vec![Ok(ResponseEvent::TextDelta("all done".into())), Ok(ResponseEvent::Done)];
            return Ok(Box::pin(stream::iter(events)));
        }
        let mut events: Vec<anyhow::Result<ResponseEvent>> = (0..self.n)
            .map(|i| {
                Ok(ResponseEvent::ToolCall {
                    index: i,
                    id: format!("call-{i}"),
                    name: "slow".into(),
                    arguments: "{}".into(),
                })
            })
            .collect();
        events.push(Ok(ResponseEvent::Done));
        Ok(Box::pin(stream::iter(events)))
    }
}

fn test_config() -> AgentLoopConfig {
    AgentLoopConfig { max_retries: 1, retry_base_wait_secs: 0, ..AgentLoopConfig::default() }
}

/// `ToolRegistry::register` takes `impl Tool + 'static` by value, so a
/// `Box<dyn Tool>` needs a thin wrapper to register through the same trait
/// object the registry stores internally.
struct BoxedToolAdapter(Box<dyn Tool>);

#[async_trait]
impl Tool for BoxedToolAdapter {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn description(&self) -> &str {
        self.0.description()
    }
    fn parameters_schema(&self) -> Value {
        self.0.parameters_schema()
    }
    fn default_policy(&self) -> ApprovalPolicy {
        self.0.default_policy()
    }
    fn output_category(&self) -> OutputCategory {
        self.0.output_category()
    }
    fn kind(&self) -> ToolKind {
        self.0.kind()
    }
    async fn execute(&self, call: &ToolCall, cancel: &CancelToken) -> ToolOutput {
        self.0.execute(call, cancel).await
    }
}

fn registry_with(tools: Vec<Box<dyn Tool>>) -> Arc<ToolRegistry> {
    let mut reg = ToolRegistry::new();
    for tool in tools {
        reg.register(BoxedToolAdapter(tool));
    }
    Arc::new(reg)
}

async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

// ─── Ordering invariants ────────────────────────────────────────────────────

#[tokio::test]
async fn single_text_turn_completes_without_tool_calls() {
    let model = Arc::new(ScriptedMockProvider::always_text("hello there"));
    let tools = registry_with(vec![]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default());

    let (handle, rx) = agent.run(CancelToken::new(), "", "hi", vec![], None);
    let events = drain(rx).await;
    let result = handle.join().await;

    assert_eq!(result.final_content, "hello there");
    assert!(!result.interrupted);
    assert!(result.error.is_none());
    assert!(matches!(events.last(), Some(AgentEvent::Done { .. })));
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::ToolCall { .. })));
}

#[tokio::test]
async fn stream_ends_in_exactly_one_terminal_event() {
    let model = Arc::new(ScriptedMockProvider::always_text("ok"));
    let agent = Agent::new(model, registry_with(vec![]), Arc::new(test_config()), AgentRuntimeContext::default());
    let (_handle, rx) = agent.run(CancelToken::new(), "", "hi", vec![], None);
    let events = drain(rx).await;
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1, "exactly one terminal event must close the stream");
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn tool_round_trip_reports_call_then_matching_result() {
    let model = Arc::new(ScriptedMockProvider::tool_then_text(
        "call-1",
        "echo",
        r#"{"value":"hi"}"#,
        "final answer",
    ));
    let tools = registry_with(vec![Box::new(EchoTool)]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default());

    let (handle, rx) = agent.run(CancelToken::new(), "", "go", vec![], None);
    let events = drain(rx).await;
    let result = handle.join().await;

    assert_eq!(result.final_content, "final answer");
    let call_pos = events
        .iter()
        .position(|e| matches!(e, AgentEvent::ToolCall { call, .. } if call.id == "call-1"))
        .expect("tool call event present");
    let result_pos = events
        .iter()
        .position(|e| matches!(e, AgentEvent::ToolResult { call_id, .. } if call_id == "call-1"))
        .expect("tool result event present");
    assert!(call_pos < result_pos, "tool_call must precede its matching tool_result");

    match &events[result_pos] {
        AgentEvent::ToolResult { output, .. } => assert_eq!(output.content, "echo:hi"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn step_done_precedes_next_steps_events() {
    let model = Arc::new(ScriptedMockProvider::tool_then_text(
        "call-1",
        "echo",
        r#"{"value":"x"}"#,
        "second step text",
    ));
    let tools = registry_with(vec![Box::new(EchoTool)]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default());
    let (_handle, rx) = agent.run(CancelToken::new(), "", "go", vec![], None);
    let events = drain(rx).await;

    let first_step_done = events
        .iter()
        .position(|e| matches!(e, AgentEvent::StepDone { snapshot, .. } if snapshot.step == 1))
        .expect("step 1 StepDone present");
    let second_step_text = events
        .iter()
        .position(|e| matches!(e, AgentEvent::TextDelta { step, .. } if *step == 2));
    if let Some(pos) = second_step_text {
        assert!(first_step_done < pos, "StepDone(1) must precede step 2 events");
    }
}

// ─── Concurrency ────────────────────────────────────────────────────────────

#[tokio::test]
async fn parallel_tool_calls_respect_max_parallel_tools_cap() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tool = ConcurrencyTrackingTool { delay: Duration::from_millis(40), active: active.clone(), peak: peak.clone() };

    let model = Arc::new(ParallelCallsProvider { n: 6 });
    let tools = registry_with(vec![Box::new(tool)]);
    let config = AgentLoopConfig { max_parallel_tools: 2, ..test_config() };
    let agent = Agent::new(model, tools, Arc::new(config), AgentRuntimeContext::default());

    let (handle, rx) = agent.run(CancelToken::new(), "", "go", vec![], None);
    let _events = drain(rx).await;
    let result = handle.join().await;

    assert_eq!(result.final_content, "all done");
    assert!(peak.load(Ordering::SeqCst) <= 2, "concurrency must never exceed max_parallel_tools");
    assert_eq!(active.load(Ordering::SeqCst), 0, "all slow calls must have finished");
}

// ─── Cancellation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_mid_stream_marks_result_interrupted() {
    let model = Arc::new(ScriptedMockProvider::tool_then_text(
        "call-1",
        "stall",
        "{}",
        "never reached",
    ));
    let tools = registry_with(vec![Box::new(StallingTool { delay: Duration::from_secs(5) })]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default());

    let cancel = CancelToken::new();
    let (handle, rx) = agent.run(cancel.clone(), "", "go", vec![], None);

    let cancel_for_task = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel_for_task.cancel();
    });

    let events = drain(rx).await;
    let result = handle.join().await;

    assert!(result.interrupted);
    assert!(result.error.is_some());
    assert!(matches!(events.last(), Some(AgentEvent::Error { .. })));

    let tool_result = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { output, .. } => Some(output),
            _ => None,
        })
        .expect("a tool_result event for the stalled call");
    assert!(tool_result.is_error);
    assert!(tool_result.content.contains("context cancelled"));
}

#[tokio::test]
async fn cancellation_after_partial_text_surfaces_as_done_not_error() {
    let model = Arc::new(ScriptedMockProvider::new(vec![vec![
        ResponseEvent::TextDelta("partial answer".into()),
        ResponseEvent::ToolCall {
            index: 0,
            id: "call-1".into(),
            name: "stall".into(),
            arguments: "{}".into(),
        },
        ResponseEvent::Done,
    ]]));
    let tools = registry_with(vec![Box::new(StallingTool { delay: Duration::from_secs(5) })]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default());

    let cancel = CancelToken::new();
    let (handle, rx) = agent.run(cancel.clone(), "", "go", vec![], None);

    let cancel_for_task = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel_for_task.cancel();
    });

    let events = drain(rx).await;
    let result = handle.join().await;

    assert!(result.interrupted);
    assert!(result.error.is_none());
    assert!(result.final_content.contains("partial answer"));
    assert!(matches!(
        events.last(),
        Some(AgentEvent::Done { interrupted: true, .. })
    ));
}

// ─── Loop detection ─────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_identical_tool_call_injects_reflection_prompt() {
    // Four identical "echo" calls in a row, each its own round, then a final
    // text reply. loop_detect_threshold is lowered to 3 so the exact-match
    // signal fires well before the script runs out.
    let mut scripts = Vec::new();
    for i in 0..3 {
        scripts.push(vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: format!("call-{i}"),
                name: "echo".into(),
                arguments: r#"{"value":"same"}"#.into(),
            },
            ResponseEvent::Done,
        ]);
    }
    scripts.push(vec![ResponseEvent::TextDelta("wrapping up".into()), ResponseEvent::Done]);
    let model = Arc::new(ScriptedMockProvider::new(scripts));
    let tools = registry_with(vec![Box::new(EchoTool)]);
    let config = AgentLoopConfig {
        loop_window_size: 5,
        loop_detect_threshold: 3,
        loop_name_threshold: 100,
        ..test_config()
    };
    let agent = Agent::new(model, tools, Arc::new(config), AgentRuntimeContext::default());

    let (handle, rx) = agent.run(CancelToken::new(), "", "go", vec![], None);
    let _events = drain(rx).await;
    let result = handle.join().await;

    assert_eq!(result.final_content, "wrapping up");
}

// ─── Context overflow recovery ──────────────────────────────────────────────

#[tokio::test]
async fn context_overflow_recovers_after_compaction_within_retry_cap() {
    let model = Arc::new(FlakyOverflowProvider { calls: AtomicU32::new(0), fail_times: 2 });
    let tools = registry_with(vec![]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default());

    let (handle, rx) = agent.run(CancelToken::new(), "system", "go", vec![], None);
    let _events = drain(rx).await;
    let result = handle.join().await;

    assert_eq!(result.final_content, "recovered");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn context_overflow_fails_after_exhausting_three_compaction_attempts() {
    let model = Arc::new(FlakyOverflowProvider { calls: AtomicU32::new(0), fail_times: 10 });
    let tools = registry_with(vec![]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default());

    let (handle, rx) = agent.run(CancelToken::new(), "system", "go", vec![], None);
    let events = drain(rx).await;
    let result = handle.join().await;

    assert!(result.error.is_some());
    assert!(result.error.as_ref().unwrap().contains("compaction attempts"));
    assert!(matches!(events.last(), Some(AgentEvent::Error { .. })));
}

// ─── Fatal provider failure ─────────────────────────────────────────────────

#[tokio::test]
async fn fatal_provider_error_ends_run_with_error_event() {
    let model = Arc::new(AlwaysFatalProvider);
    let tools = registry_with(vec![]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default());

    let (handle, rx) = agent.run(CancelToken::new(), "", "go", vec![], None);
    let events = drain(rx).await;
    let result = handle.join().await;

    assert!(result.error.is_some());
    assert!(result.error.as_ref().unwrap().contains("invalid API key"));
    assert!(matches!(events.last(), Some(AgentEvent::Error { .. })));
}

// ─── Hooks observe the run ──────────────────────────────────────────────────

struct RecordingHook {
    completed: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl crate::hooks::AgentHook for RecordingHook {
    async fn on_complete(&self, final_content: &str) {
        *self.completed.lock().unwrap() = Some(final_content.to_string());
    }
}

#[tokio::test]
async fn on_complete_hook_fires_with_final_content() {
    let completed = Arc::new(Mutex::new(None));
    let mut chain = crate::hooks::HookChain::new();
    chain.push(Box::new(RecordingHook { completed: completed.clone() }));

    let model = Arc::new(ScriptedMockProvider::always_text("settled"));
    let agent = Agent::new(model, registry_with(vec![]), Arc::new(test_config()), AgentRuntimeContext::default())
        .with_hooks(chain);

    let (handle, rx) = agent.run(CancelToken::new(), "", "hi", vec![], None);
    let _events = drain(rx).await;
    let _ = handle.join().await;

    assert_eq!(completed.lock().unwrap().as_deref(), Some("settled"));
}

#[tokio::test]
async fn before_tool_call_veto_short_circuits_dispatch() {
    struct DenyAll;
    #[async_trait]
    impl crate::hooks::AgentHook for DenyAll {
        async fn before_tool_call(&self, _call: &ToolCall) -> bool {
            false
        }
    }
    let mut chain = crate::hooks::HookChain::new();
    chain.push(Box::new(DenyAll));

    let model = Arc::new(ScriptedMockProvider::tool_then_text(
        "call-1",
        "echo",
        r#"{"value":"x"}"#,
        "after veto",
    ));
    let tools = registry_with(vec![Box::new(EchoTool)]);
    let agent = Agent::new(model, tools, Arc::new(test_config()), AgentRuntimeContext::default())
        .with_hooks(chain);

    let (handle, rx) = agent.run(CancelToken::new(), "", "go", vec![], None);
    let events = drain(rx).await;
    let _ = handle.join().await;

    let blocked = events.iter().any(|e| {
        matches!(e, AgentEvent::ToolResult { output, .. }
            if output.is_error && output.content.to_lowercase().contains("polic"))
    });
    assert!(blocked, "vetoed call must surface as a blocked tool result, not a silent drop");
}
