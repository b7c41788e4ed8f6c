// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent loop controller: drives one user turn through a
//! reason→act→observe cycle until the model stops calling tools or a
//! terminal condition fires.
//!
//! [`Agent::run`] returns immediately; the actual work happens on a spawned
//! task so a transport can hold the returned [`RunHandle`] and event
//! receiver without blocking. A supervisory outer task wraps the driving
//! task in its own `tokio::spawn` purely so a panic inside the loop is
//! observed as a `JoinError` and converted into a terminal
//! [`AgentEvent::Error`] instead of silently dropping the event channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use relay_config::{AgentLoopConfig, ModelPolicy};
use relay_model::{
    classify_provider_error, retry_with_backoff, CompletionRequest, CompletionResponse,
    FunctionCall, Message, MessageContent, ModelError, ModelProvider, ResponseEvent, Role,
    ToolCallDelta,
};
use relay_tools::{ToolCall, ToolKind, ToolOutput, ToolOutputPart, ToolRegistry};

use crate::cancel::CancelToken;
use crate::compact::{compact_session_with_strategy, emergency_compact, smart_truncate};
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::hooks::HookChain;
use crate::loop_detector::LoopDetector;
use crate::middleware::{repair_tool_pairing, MiddlewarePipeline, RepairPolicy};
use crate::runtime_context::AgentRuntimeContext;
use crate::scrubber::{scrub, ScrubMode};
use crate::session::Session;
use crate::state::{RunState, StateMachine};

/// The outcome of a completed (or aborted) run. Mirrors the last `done` or
/// `error` event emitted on the stream, plus whatever final text the
/// controller settled on.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub final_content: String,
    /// `true` when the run ended via cancellation rather than a normal or
    /// fallback completion.
    pub interrupted: bool,
    /// Set when the run ended in `error` rather than `done`.
    pub error: Option<String>,
}

/// Handle to a spawned run. The underlying [`RunResult`] is populated once
/// the run's event stream closes; awaiting [`RunHandle::join`] before the
/// stream is drained will simply wait alongside it.
pub struct RunHandle {
    inner: tokio::task::JoinHandle<RunResult>,
}

impl RunHandle {
    /// Wait for the run to finish and return its result. A panic inside the
    /// driving task is reported as an error result rather than propagated,
    /// matching the terminal `error` event already sent on the stream for
    /// that case.
    pub async fn join(self) -> RunResult {
        match self.inner.await {
            Ok(result) => result,
            Err(join_err) => RunResult {
                final_content: String::new(),
                interrupted: false,
                error: Some(format!("run task panicked: {join_err}")),
            },
        }
    }
}

/// Drives the reason→act→observe cycle for a single user turn.
///
/// Cheap to construct per chat/session; holds only shared, clonable
/// collaborators (`Arc<dyn ModelProvider>`, `Arc<ToolRegistry>`, resolved
/// config). All per-run state (the message buffer, loop detector, state
/// machine) lives on the stack of the spawned task, not on `Agent` itself —
/// nothing prevents running many turns concurrently from one `Agent`.
pub struct Agent {
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    tool_executor: Arc<crate::tool_exec::ToolExecutor>,
    config: Arc<AgentLoopConfig>,
    runtime: AgentRuntimeContext,
    hooks: Arc<HookChain>,
    middleware: Arc<MiddlewarePipeline>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        config: Arc<AgentLoopConfig>,
        runtime: AgentRuntimeContext,
    ) -> Self {
        let tool_executor = Arc::new(crate::tool_exec::ToolExecutor::new(
            tools.clone(),
            config.max_parallel_tools,
            config.tool_timeout(),
        ));
        Self {
            model,
            tools,
            tool_executor,
            config,
            runtime,
            hooks: Arc::new(HookChain::new()),
            middleware: Arc::new(MiddlewarePipeline::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: HookChain) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewarePipeline) -> Self {
        self.middleware = Arc::new(middleware);
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn runtime(&self) -> &AgentRuntimeContext {
        &self.runtime
    }

    pub fn set_model(&mut self, model: Arc<dyn ModelProvider>) {
        self.model = model;
    }

    /// Start a new run. Returns immediately; the controller drives the turn
    /// on a separate task and streams events on the returned receiver. The
    /// channel is closed exactly once, after the terminal `done`/`error`
    /// event.
    ///
    /// `model_override`, when set, is used only to resolve the per-model
    /// [`relay_config::ModelPolicy`] (§4.8) — this crate has no
    /// provider-switching registry of its own; the concrete `ModelProvider`
    /// is fixed at construction and supplied by the caller.
    pub fn run(
        &self,
        cancel: CancelToken,
        system_prompt: impl Into<String>,
        user_message: impl Into<String>,
        history: Vec<Message>,
        model_override: Option<String>,
    ) -> (RunHandle, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(256);

        let driver = RunDriver {
            model: self.model.clone(),
            tools: self.tools.clone(),
            tool_executor: self.tool_executor.clone(),
            config: self.config.clone(),
            hooks: self.hooks.clone(),
            middleware: self.middleware.clone(),
        };
        let system_prompt = system_prompt.into();
        let user_message = user_message.into();

        let outer = tokio::spawn(async move {
            let tx_for_panic = tx.clone();
            let inner = tokio::spawn(async move {
                driver
                    .drive(cancel, system_prompt, user_message, history, model_override, tx)
                    .await
            });
            match inner.await {
                Ok(result) => result,
                Err(join_err) => {
                    let message = format!("run task panicked: {join_err}");
                    let _ = tx_for_panic
                        .send(AgentEvent::Error { message: message.clone() })
                        .await;
                    RunResult { final_content: String::new(), interrupted: false, error: Some(message) }
                }
            }
        });

        (RunHandle { inner: outer }, rx)
    }
}

/// Owns everything a single run needs; constructed fresh per [`Agent::run`]
/// call and moved onto the spawned task.
struct RunDriver {
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    tool_executor: Arc<crate::tool_exec::ToolExecutor>,
    config: Arc<AgentLoopConfig>,
    hooks: Arc<HookChain>,
    middleware: Arc<MiddlewarePipeline>,
}

fn effective_hard_ratio(config: &AgentLoopConfig) -> f32 {
    (config.context_hard_ratio - config.compaction_overhead_reserve).max(0.0)
}

/// Logs once per check when context usage has crossed `context_warn_ratio`
/// but hasn't yet reached the hard ratio that triggers compaction.
fn warn_if_context_high(session: &Session, config: &AgentLoopConfig, hard_ratio: f32) {
    let fraction = session.context_fraction();
    if fraction >= config.context_warn_ratio && fraction < hard_ratio {
        warn!(
            context_fraction = fraction,
            context_warn_ratio = config.context_warn_ratio,
            "context usage crossed warn_ratio"
        );
    }
}

fn tool_schema_to_model(s: &relay_tools::ToolSchema) -> relay_model::ToolSchema {
    relay_model::ToolSchema {
        name: s.name.clone(),
        description: s.description.clone(),
        parameters: s.parameters.clone(),
    }
}

/// Drain one (non-retried) LLM call into an accumulated [`CompletionResponse`],
/// forwarding text deltas onto `tx` in real time as they arrive. Tool-call
/// fragments are merged by the model's own `index`, not by arrival order, so
/// interleaved parallel tool-call streams reassemble correctly.
async fn stream_one_call(
    model: &dyn ModelProvider,
    req: CompletionRequest,
    step: u32,
    tx: &mpsc::Sender<AgentEvent>,
) -> Result<CompletionResponse, ModelError> {
    let mut stream = model
        .complete(req)
        .await
        .map_err(|e| classify_provider_error(&e.to_string()))?;

    let mut content = String::new();
    let mut calls: BTreeMap<u32, ToolCallDelta> = BTreeMap::new();
    let mut usage = relay_model::Usage::default();

    while let Some(event) = stream.next().await {
        match event.map_err(|e| classify_provider_error(&e.to_string()))? {
            ResponseEvent::TextDelta(t) => {
                content.push_str(&t);
                let _ = tx.send(AgentEvent::TextDelta { step, text: t }).await;
            }
            ResponseEvent::ThinkingDelta(_) => {}
            ResponseEvent::ToolCall { index, id, name, arguments } => {
                let entry = calls.entry(index).or_insert_with(|| ToolCallDelta {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
                entry.arguments.push_str(&arguments);
            }
            ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens } => {
                usage = relay_model::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens };
            }
            ResponseEvent::Done => break,
            ResponseEvent::Error(msg) => return Err(classify_provider_error(&msg)),
        }
    }

    Ok(CompletionResponse {
        content,
        tool_calls: calls.into_values().collect(),
        model_used: model.model_name().to_string(),
        usage,
    })
}

impl RunDriver {
    #[instrument(skip(self, cancel, history, tx))]
    async fn drive(
        self,
        cancel: CancelToken,
        system_prompt: String,
        user_message: String,
        history: Vec<Message>,
        model_override: Option<String>,
        tx: mpsc::Sender<AgentEvent>,
    ) -> RunResult {
        let model_id = model_override.unwrap_or_else(|| self.model.model_name().to_string());
        let policy = self.config.resolve_policy(&model_id);

        self.tool_executor.clear_cache().await;

        let mut sm = StateMachine::new(model_id);
        let mut session = Session::new(self.config.context_max_tokens);
        let mut loop_detector = LoopDetector::new(
            self.config.loop_window_size,
            self.config.loop_detect_threshold as u32,
            self.config.loop_name_threshold as u32,
        );

        if let Some(warning) = self.config.doom_loop {
            warn!(
                doom_loop = warning,
                "doom_loop is deprecated and ignored; use loop_detect_threshold/loop_window_size"
            );
        }

        if !system_prompt.trim().is_empty() {
            session.push(Message::system(system_prompt));
        }
        session.push_many(history);
        session.push(Message::user(user_message));

        let mut reactive_compactions = 0u32;
        let mut consecutive_all_failed = 0u32;
        let mut auto_continue_used = false;
        let mut last_assistant_text = String::new();
        let mut compacted_this_step = false;

        loop {
            if cancel.is_cancelled() {
                self.transition(&mut sm, RunState::Aborted).await;
                sm.record_error();
                self.hooks.on_error(&AgentError::Cancelled).await;
                // A run cancelled after the model had already produced
                // visible text has a usable partial answer: surface it as a
                // `done` with `interrupted` set rather than an `error`, so
                // callers that only care about "is there something to show
                // the user" don't have to special-case cancellation.
                if !last_assistant_text.trim().is_empty() {
                    let final_content = format!("{last_assistant_text}\n[interrupted]");
                    let _ = tx
                        .send(AgentEvent::Done { final_content: final_content.clone(), interrupted: true })
                        .await;
                    return RunResult { final_content, interrupted: true, error: None };
                }
                let message = AgentError::Cancelled.to_string();
                let _ = tx.send(AgentEvent::Error { message: message.clone() }).await;
                return RunResult { final_content: "(interrupted)".to_string(), interrupted: true, error: Some(message) };
            }

            if self.config.max_run_timeout_secs > 0
                && sm.snapshot().elapsed_ms / 1000 >= self.config.max_run_timeout_secs
            {
                return self
                    .fail(
                        &mut sm,
                        &tx,
                        AgentError::Internal(anyhow::anyhow!("run exceeded wall-clock timeout")),
                    )
                    .await;
            }

            sm.begin_step();
            let step = sm.snapshot().step;

            if policy.progress_interval > 0 && step % policy.progress_interval == 0 && step > 1 {
                let nudge_count = step / policy.progress_interval;
                let text = if policy.progress_escalation && nudge_count >= 2 {
                    format!(
                        "Reminder: continue making concrete progress on the user's request. \
                         This reminder has now fired {nudge_count} times — if you are stuck, \
                         say so explicitly and explain what is blocking you."
                    )
                } else {
                    "Reminder: continue making concrete progress on the user's request.".to_string()
                };
                session.push(Message::user(text));
            }

            let hard_ratio = effective_hard_ratio(&self.config);
            if session.context_fraction() >= hard_ratio {
                self.transition(&mut sm, RunState::Compacting).await;
                self.compact(&mut session, &policy).await;
                compacted_this_step = true;
                self.transition(&mut sm, RunState::Streaming).await;
            } else {
                warn_if_context_high(&session, &self.config, hard_ratio);
                self.transition(&mut sm, RunState::Streaming).await;
            }

            // A context-overflow failure is retried against *this* step: the
            // message buffer is re-sanitized and rebuilt against the
            // freshly-compacted session and the LLM is called again without
            // advancing the step counter or re-running the per-step nudge.
            let mut response = 'attempt: loop {
                if policy.repair_tool_pairing {
                    repair_tool_pairing(&mut session.messages, RepairPolicy::Synthetic);
                }
                if policy.enforce_turn_ordering {
                    crate::middleware::enforce_turn_ordering(&mut session.messages);
                }
                session.recalculate_tokens();

                self.middleware.run_before_model(&mut session.messages, step);

                let request = CompletionRequest {
                    messages: session.messages.clone(),
                    tools: self.tools.schemas().iter().map(tool_schema_to_model).collect(),
                    stream: true,
                    system_dynamic_suffix: None,
                };
                self.hooks.before_llm_call(&request, step).await;

                let model = self.model.clone();
                let tx_attempt = tx.clone();
                let req_for_retry = request.clone();
                let call_future = retry_with_backoff(self.config.max_retries, self.config.retry_base_wait(), move || {
                    let model = model.clone();
                    let req = req_for_retry.clone();
                    let tx = tx_attempt.clone();
                    async move { stream_one_call(&*model, req, step, &tx).await }
                });

                let outcome = if self.config.max_step_timeout_secs > 0 {
                    match tokio::time::timeout(Duration::from_secs(self.config.max_step_timeout_secs), call_future).await {
                        Ok(r) => r,
                        Err(_) => Err(ModelError::Fatal("step exceeded wall-clock timeout".into())),
                    }
                } else {
                    call_future.await
                };

                match outcome {
                    Ok(outcome) => {
                        if outcome.attempts > 1 {
                            self.transition(&mut sm, RunState::Retrying).await;
                            for _ in 0..(outcome.attempts - 1) {
                                sm.record_retry();
                            }
                            self.transition(&mut sm, RunState::Streaming).await;
                        }
                        break 'attempt outcome.value;
                    }
                    Err(ModelError::ContextOverflow { message, .. }) => {
                        if reactive_compactions < 3 {
                            reactive_compactions += 1;
                            self.transition(&mut sm, RunState::Compacting).await;
                            self.compact(&mut session, &policy).await;
                            compacted_this_step = true;
                            self.transition(&mut sm, RunState::Streaming).await;
                            continue 'attempt;
                        }
                        return self
                            .fail(
                                &mut sm,
                                &tx,
                                AgentError::LlmContextOverflow { attempts: reactive_compactions, message },
                            )
                            .await;
                    }
                    Err(ModelError::Transient(message)) => {
                        return self.fail(&mut sm, &tx, AgentError::LlmTransient(message)).await;
                    }
                    Err(ModelError::Fatal(message)) => {
                        return self.fail(&mut sm, &tx, AgentError::LlmFatal(message)).await;
                    }
                }
            };

            sm.add_tokens((response.usage.input_tokens + response.usage.output_tokens) as usize);
            if let Some(budget) = self.config.max_token_budget {
                if sm.snapshot().tokens_used as u64 > budget {
                    return self
                        .fail(&mut sm, &tx, AgentError::Internal(anyhow::anyhow!("token budget exceeded")))
                        .await;
                }
            }

            self.middleware.run_after_model(&mut response, step);
            self.hooks.after_llm_call(&response, step).await;

            if !response.content.trim().is_empty() {
                last_assistant_text = response.content.clone();
            }

            let snapshot_compacted = compacted_this_step;
            compacted_this_step = false;
            let _ = tx
                .send(AgentEvent::StepDone { snapshot: sm.snapshot(), compacted: snapshot_compacted })
                .await;

            if response.tool_calls.is_empty() {
                if snapshot_compacted && response.content.trim().is_empty() && !auto_continue_used {
                    auto_continue_used = true;
                    session.push(Message::user("continue"));
                    continue;
                }

                let mut final_text = scrub(&response.content, ScrubMode::Strict);
                if final_text.trim().is_empty() && step > 1 {
                    final_text = self.followup_summary(&session).await.unwrap_or_default();
                }
                if final_text.trim().is_empty() {
                    final_text = last_assistant_text.clone();
                }

                self.transition(&mut sm, RunState::Complete).await;
                self.hooks.on_complete(&final_text).await;
                let _ = tx
                    .send(AgentEvent::Done { final_content: final_text.clone(), interrupted: false })
                    .await;
                return RunResult { final_content: final_text, interrupted: false, error: None };
            }

            // Tool-call branch: append the assistant turn, then the tool calls.
            if !response.content.trim().is_empty() {
                session.push(Message::assistant(response.content.clone()));
            }
            let mut tool_calls: Vec<ToolCall> = Vec::with_capacity(response.tool_calls.len());
            for delta in &response.tool_calls {
                session.push(Message {
                    role: Role::Assistant,
                    content: MessageContent::ToolCall {
                        tool_call_id: delta.id.clone(),
                        function: FunctionCall { name: delta.name.clone(), arguments: delta.arguments.clone() },
                    },
                });
                let args = serde_json::from_str(&delta.arguments).unwrap_or(serde_json::Value::Null);
                tool_calls.push(ToolCall { id: delta.id.clone(), name: delta.name.clone(), args });
            }

            let mut reflections = Vec::new();
            for call in &tool_calls {
                let kind = self.tools.get_tool_kind(&call.name).unwrap_or(ToolKind::Execute);
                if let Some(signal) = loop_detector.observe(&call.name, &call.args, kind) {
                    reflections.push(signal.to_prompt());
                }
            }

            for call in &tool_calls {
                sm.record_tool_call(&call.name);
                let _ = tx.send(AgentEvent::ToolCall { step, call: call.clone() }).await;
            }

            self.transition(&mut sm, RunState::ToolExec).await;
            let outputs = self.dispatch_tools(&tool_calls, &cancel).await;

            let mut all_failed = true;
            for (call, output) in tool_calls.iter().zip(outputs.into_iter()) {
                self.hooks.after_tool_call(call, &output).await;
                if !output.is_error {
                    all_failed = false;
                }
                let category = self.tools.output_category(&call.name);
                let cap_tokens = (self.config.max_output_chars / 4).max(1);
                let truncated = smart_truncate(&output.content, category, cap_tokens);
                let final_output = if truncated != output.content {
                    ToolOutput {
                        call_id: output.call_id.clone(),
                        content: truncated.clone(),
                        parts: vec![ToolOutputPart::Text(truncated.clone())],
                        is_error: output.is_error,
                        metadata: output.metadata.clone(),
                    }
                } else {
                    output
                };
                let _ = tx
                    .send(AgentEvent::ToolResult { step, call_id: call.id.clone(), output: final_output.clone() })
                    .await;
                session.push(Message::tool_result(call.id.clone(), final_output.content));
            }
            session.recalculate_tokens();

            if all_failed && !tool_calls.is_empty() {
                consecutive_all_failed += 1;
                if consecutive_all_failed >= 3 {
                    session.push(Message::user(
                        "Stop retrying this approach — report the failures to the user instead of repeating the same tool calls.",
                    ));
                    consecutive_all_failed = 0;
                }
            } else {
                consecutive_all_failed = 0;
            }

            for reflection in reflections {
                session.push(Message::user(reflection));
            }

            let hard_ratio = effective_hard_ratio(&self.config);
            if session.context_fraction() >= hard_ratio {
                self.transition(&mut sm, RunState::Compacting).await;
                self.compact(&mut session, &policy).await;
                compacted_this_step = true;
                self.transition(&mut sm, RunState::Streaming).await;
            } else {
                warn_if_context_high(&session, &self.config, hard_ratio);
            }
            // Next loop iteration transitions ToolExec/Streaming -> Streaming.
        }
    }

    /// Transition the state machine and notify the hook chain — the single
    /// path through which `RunState` changes so `on_state_change` observers
    /// never miss a transition.
    async fn transition(&self, sm: &mut StateMachine, next: RunState) -> bool {
        let from = sm.state();
        if sm.transition(next) {
            self.hooks.on_state_change(from, next).await;
            true
        } else {
            false
        }
    }

    async fn fail(&self, sm: &mut StateMachine, tx: &mpsc::Sender<AgentEvent>, error: AgentError) -> RunResult {
        self.transition(sm, RunState::Error).await;
        sm.record_error();
        self.hooks.on_error(&error).await;
        let message = error.to_string();
        let _ = tx.send(AgentEvent::Error { message: message.clone() }).await;
        RunResult { final_content: String::new(), interrupted: false, error: Some(message) }
    }

    /// Dispatch tool calls concurrently through the fan-out executor,
    /// restoring original call-index order before returning — concurrency
    /// happens inside `tool_executor`, ordering is restored here.
    async fn dispatch_tools(&self, calls: &[ToolCall], cancel: &CancelToken) -> Vec<ToolOutput> {
        let futures = calls.iter().cloned().enumerate().map(|(i, call)| {
            let hooks = self.hooks.clone();
            let tool_executor = self.tool_executor.clone();
            let cancel = cancel.clone();
            async move {
                let output = if !hooks.before_tool_call(&call).await {
                    crate::tool_exec::ToolExecutor::blocked_result(&call)
                } else {
                    match tool_executor.execute(call.clone(), &cancel).await {
                        Ok(out) => out,
                        Err(()) => ToolOutput::err(&call.id, "context cancelled"),
                    }
                };
                (i, output)
            }
        });
        let mut results: Vec<Option<ToolOutput>> = (0..calls.len()).map(|_| None).collect();
        for (i, output) in futures::future::join_all(futures).await {
            results[i] = Some(output);
        }
        results.into_iter().map(|o| o.expect("every index dispatched")).collect()
    }

    /// Replace the middle of the session with a summary, preserving the
    /// system message and the most recent `compact_keep_last` messages
    /// verbatim, extending the preserved tail backward if needed so no
    /// tool_call is left without its matching tool_result. Falls back to
    /// the deterministic [`emergency_compact`] if the summarizer call fails
    /// or returns empty content — that path never fails.
    async fn compact(&self, session: &mut Session, policy: &ModelPolicy) {
        let _ = policy;
        let system_msg = session.messages.first().filter(|m| m.role == Role::System).cloned();
        let rest: Vec<Message> = if system_msg.is_some() {
            session.messages[1..].to_vec()
        } else {
            session.messages.clone()
        };

        if rest.len() <= self.config.compact_keep_last {
            return;
        }

        let tail_start = extend_tail_for_pairing(&rest, rest.len() - self.config.compact_keep_last);
        let middle = rest[..tail_start].to_vec();
        let tail = rest[tail_start..].to_vec();

        let summary = self.summarize_middle(middle).await;
        if summary.trim().is_empty() {
            emergency_compact(&mut session.messages, system_msg, self.config.compact_keep_last);
        } else {
            let mut new_messages = Vec::new();
            if let Some(sys) = system_msg {
                new_messages.push(sys);
            }
            new_messages.push(Message::system(format!(
                "[Context compacted — summary of earlier conversation]\n\n{summary}"
            )));
            new_messages.extend(tail);
            session.replace_messages(new_messages);
        }
        session.recalculate_tokens();
    }

    async fn summarize_middle(&self, middle: Vec<Message>) -> String {
        if middle.is_empty() {
            return String::new();
        }
        let mut prompt_messages = middle;
        compact_session_with_strategy(&mut prompt_messages, None, &self.config.compaction_strategy);
        let req = CompletionRequest { messages: prompt_messages, tools: vec![], stream: false, system_dynamic_suffix: None };
        match self.model.generate(req).await {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content,
            _ => String::new(),
        }
    }

    /// A tool-less follow-up call asking the model for a plain-text summary,
    /// used when the final turn produced no tool calls but also no text.
    async fn followup_summary(&self, session: &Session) -> Option<String> {
        let mut messages = session.messages.clone();
        messages.push(Message::user("Please provide a plain-text summary of the results so far."));
        let req = CompletionRequest { messages, tools: vec![], stream: false, system_dynamic_suffix: None };
        match self.model.generate(req).await {
            Ok(resp) if !resp.content.trim().is_empty() => Some(scrub(&resp.content, ScrubMode::Strict)),
            _ => None,
        }
    }
}

/// Walk `tail_start` backward while a `ToolResult` kept in the tail
/// references a `ToolCall` that would otherwise be summarized away in the
/// middle, so pairing survives compaction.
fn extend_tail_for_pairing(rest: &[Message], mut tail_start: usize) -> usize {
    loop {
        let mut extended = false;
        for m in &rest[tail_start..] {
            if let MessageContent::ToolResult { tool_call_id, .. } = &m.content {
                if let Some(call_idx) = rest[..tail_start].iter().position(|mm| {
                    matches!(&mm.content, MessageContent::ToolCall { tool_call_id: id, .. } if id == tool_call_id)
                }) {
                    if call_idx < tail_start {
                        tail_start = call_idx;
                        extended = true;
                    }
                }
            }
        }
        if !extended {
            break;
        }
    }
    tail_start
}
