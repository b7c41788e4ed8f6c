// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Integration tests exercising the Agent Loop Core end to end with the
/// mock model providers — no real LLM or network access required.
use std::sync::Arc;

use relay_core::{Agent, AgentEvent, AgentRuntimeContext, CancelToken};
use relay_model::{Message, ModelProvider, MockProvider, ScriptedMockProvider};
use relay_tools::{ApprovalPolicy, ShellTool, Tool, ToolCall, ToolPolicy, ToolRegistry};

fn mock_agent(model: Arc<dyn ModelProvider>) -> Agent {
    let tools = Arc::new(ToolRegistry::new());
    let config = Arc::new(relay_config::AgentLoopConfig::default());
    Agent::new(model, tools, config, AgentRuntimeContext::default())
}

// ── Agent loop, mock provider ─────────────────────────────────────────────────

#[tokio::test]
async fn agent_returns_mock_response() {
    let agent = mock_agent(Arc::new(MockProvider));
    let cancel = CancelToken::new();
    let (handle, mut events) = agent.run(cancel, "", "hello", Vec::new(), None);

    let mut got_text = false;
    while let Some(event) = events.recv().await {
        if let AgentEvent::TextDelta { text, .. } = event {
            if text.contains("MOCK") {
                got_text = true;
            }
        }
    }
    assert!(got_text, "expected at least one TextDelta event containing MOCK");

    let result = handle.join().await;
    assert!(result.error.is_none(), "run should complete without error");
    assert!(!result.interrupted);
    assert!(result.final_content.contains("MOCK: hello"));
}

#[tokio::test]
async fn agent_run_is_cancellable_before_start() {
    let agent = mock_agent(Arc::new(MockProvider));
    let cancel = CancelToken::new();
    cancel.cancel();

    let (handle, mut events) = agent.run(cancel, "", "hello", Vec::new(), None);
    while events.recv().await.is_some() {}

    let result = handle.join().await;
    assert!(result.interrupted, "run cancelled up front must report interrupted");
}

// ── Agent loop driving a real registered tool through ScriptedMockProvider ────

#[tokio::test]
async fn agent_executes_tool_call_then_returns_final_text() {
    let provider = ScriptedMockProvider::tool_then_text(
        "call-1",
        "shell",
        r#"{"shell_command":"echo from_tool"}"#,
        "all done",
    );
    let mut registry = ToolRegistry::new();
    registry.register(ShellTool::default());
    let tools = Arc::new(registry);
    let config = Arc::new(relay_config::AgentLoopConfig::default());
    let agent = Agent::new(Arc::new(provider), tools, config, AgentRuntimeContext::default());

    let cancel = CancelToken::new();
    let (handle, mut events) = agent.run(cancel, "", "run the echo", Vec::new(), None);

    let mut saw_tool_call = false;
    let mut saw_tool_result = false;
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::ToolCall { call, .. } => {
                assert_eq!(call.name, "shell");
                saw_tool_call = true;
            }
            AgentEvent::ToolResult { output, .. } => {
                assert!(!output.is_error, "shell tool should succeed: {}", output.content);
                assert!(output.content.contains("from_tool"));
                saw_tool_result = true;
            }
            _ => {}
        }
    }
    assert!(saw_tool_call, "expected a ToolCall event");
    assert!(saw_tool_result, "expected a ToolResult event");

    let result = handle.join().await;
    assert!(result.error.is_none());
    assert_eq!(result.final_content, "all done");
}

// ── Config defaults ────────────────────────────────────────────────────────────

#[test]
fn config_defaults_are_sane() {
    let cfg = relay_config::Config::default();
    assert_eq!(cfg.model.provider, "mock");
    assert!(cfg.agent.max_retries > 0);
    assert!(cfg.agent.context_hard_ratio > cfg.agent.context_warn_ratio);
}

#[test]
fn config_load_with_no_files_falls_back_to_defaults() {
    // No explicit path and (almost certainly) no search-path files present in
    // this sandbox — load() must still produce a usable Config, not an error.
    let cfg = relay_config::load(None).expect("load must fall back to defaults cleanly");
    assert_eq!(cfg.model.provider, "mock");
}

// ── Tool policy ─────────────────────────────────────────────────────────────────

#[test]
fn tool_policy_auto_approve() {
    use relay_config::ToolsConfig;

    let cfg = ToolsConfig::default();
    let policy = ToolPolicy::from_config(&cfg);
    assert_eq!(policy.decide("cat /etc/hosts"), ApprovalPolicy::Auto);
    assert_eq!(policy.decide("ls /tmp"), ApprovalPolicy::Auto);
}

#[test]
fn tool_policy_deny() {
    use relay_config::ToolsConfig;

    let cfg = ToolsConfig {
        deny_patterns: vec!["rm -rf /*".into()],
        ..ToolsConfig::default()
    };
    let policy = ToolPolicy::from_config(&cfg);
    assert_eq!(policy.decide("rm -rf /*"), ApprovalPolicy::Deny);
}

// ── Built-in tools ────────────────────────────────────────────────────────────

#[tokio::test]
async fn shell_tool_executes_echo() {
    let tool = ShellTool::default();
    let call = ToolCall {
        id: "1".into(),
        name: "shell".into(),
        args: serde_json::json!({ "shell_command": "echo hello_world" }),
    };
    let output = tool.execute(&call, &CancelToken::new()).await;
    assert!(!output.is_error);
    assert!(output.content.contains("hello_world"));
}

#[tokio::test]
async fn fs_tool_write_read_roundtrip() {
    use relay_tools::FsTool;

    let path = format!("/tmp/relay_integration_test_{}.txt", std::process::id());

    let write_call = ToolCall {
        id: "w1".into(),
        name: "fs".into(),
        args: serde_json::json!({ "operation": "write", "path": path, "content": "roundtrip" }),
    };
    let wo = FsTool.execute(&write_call, &CancelToken::new()).await;
    assert!(!wo.is_error, "write failed: {}", wo.content);

    let read_call = ToolCall {
        id: "r1".into(),
        name: "fs".into(),
        args: serde_json::json!({ "operation": "read", "path": path }),
    };
    let ro = FsTool.execute(&read_call, &CancelToken::new()).await;
    assert!(!ro.is_error);
    assert!(ro.content.contains("roundtrip"));

    let _ = std::fs::remove_file(&path);
}

// ── Gateway: cancellation registry + inbound buffering ────────────────────────

#[tokio::test]
async fn cancellation_registry_latest_wins() {
    use relay_gateway::CancellationRegistry;

    let registry = CancellationRegistry::new();
    let first = registry.register("chat-1").await;
    assert!(!first.is_cancelled());

    // Registering again for the same chat preempts the first run.
    let second = registry.register("chat-1").await;
    assert!(first.is_cancelled(), "prior run's token must be cancelled");
    assert!(!second.is_cancelled());
}

#[tokio::test]
async fn inbound_buffer_coalesces_quick_successive_messages() {
    use relay_gateway::{InboundBuffer, RawInbound};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    let (tx, mut rx) = mpsc::channel(8);
    let buffer = InboundBuffer::new(tx);

    buffer
        .submit(RawInbound {
            chat_id: "c1".into(),
            user_id: "u1".into(),
            message_id: 1,
            text: "hello".into(),
            media: Vec::new(),
            media_group_id: None,
        })
        .await;
    buffer
        .submit(RawInbound {
            chat_id: "c1".into(),
            user_id: "u1".into(),
            message_id: 2,
            text: "world".into(),
            media: Vec::new(),
            media_group_id: None,
        })
        .await;

    let coalesced = timeout(Duration::from_millis(2500), rx.recv())
        .await
        .expect("debounce must flush")
        .expect("channel must not close");
    assert_eq!(coalesced.text, "hello\nworld");
}

// ── Agent hook chain ─────────────────────────────────────────────────────────

#[tokio::test]
async fn agent_with_policy_hook_vetoes_denied_tool_call() {
    use relay_core::{HookChain, PolicyHook};
    use relay_config::ToolsConfig;

    let provider = ScriptedMockProvider::tool_then_text(
        "call-1",
        "shell",
        r#"{"shell_command":"rm -rf /*"}"#,
        "never reached",
    );
    let mut registry = ToolRegistry::new();
    registry.register(ShellTool::default());
    let tools = Arc::new(registry);
    let config = Arc::new(relay_config::AgentLoopConfig::default());

    let policy = ToolPolicy::from_config(&ToolsConfig {
        deny_patterns: vec!["rm -rf /*".into()],
        ..ToolsConfig::default()
    });
    let mut hooks = HookChain::new();
    hooks.push(Box::new(PolicyHook::new(policy)));

    let agent = Agent::new(Arc::new(provider), tools, config, AgentRuntimeContext::default())
        .with_hooks(hooks);

    let cancel = CancelToken::new();
    let (_handle, mut events) = agent.run(cancel, "", "please clean up", Vec::new(), None);

    let mut saw_blocked_result = false;
    while let Some(event) = events.recv().await {
        if let AgentEvent::ToolResult { output, .. } = event {
            if output.is_error {
                saw_blocked_result = true;
            }
        }
    }
    assert!(saw_blocked_result, "denied tool call must surface as a blocked/errored result");
}

#[test]
fn message_constructors_roundtrip_text() {
    let m = Message::user("Do something");
    assert_eq!(m.as_text(), Some("Do something"));
}
