// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentLoopConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name with `--model <key>` or `--model <key>/<model>`.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2          # default model for this provider
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier, used only as a label forwarded to the concrete
    /// `ModelProvider` implementation selected by the caller. This crate does
    /// not ship or select provider drivers.
    pub provider: String,
    /// Model name forwarded to the provider
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override. Useful for local proxies or self-hosted gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0-2.0)
    pub temperature: Option<f32>,
    /// Path to a YAML scripted-responses file (used when provider = "mock").
    pub mock_responses_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            mock_responses_file: None,
        }
    }
}

/// Strategy used when compacting the session context.
///
/// `Structured` (default) instructs the model to produce a typed Markdown
/// checkpoint with fixed sections (Active Task, Key Decisions, Files &
/// Artifacts, Constraints, Pending Items, Session Narrative).  This produces
/// checkpoints that are easier for the model to navigate on future turns.
///
/// `Narrative` uses a free-form summarisation prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

/// Behavioral overrides resolved per run by substring-matching the model
/// identifier against [`AgentLoopConfig::model_policies`]. See
/// [`AgentLoopConfig::resolve_policy`] for the resolver (longest-substring
/// match).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPolicy {
    /// Repair orphan tool_call/tool_result pairs before each LLM call.
    #[serde(default = "default_true")]
    pub repair_tool_pairing: bool,
    /// Enforce strict assistant/user/tool alternation in the message buffer.
    #[serde(default)]
    pub enforce_turn_ordering: bool,
    /// How this model expresses hidden reasoning in its output.
    #[serde(default)]
    pub reasoning_format: ReasoningFormat,
    /// Inject a progress nudge every N steps (0 disables).
    #[serde(default)]
    pub progress_interval: u32,
    /// Escalate the wording of the progress nudge on repeated firing.
    #[serde(default)]
    pub progress_escalation: bool,
    /// System-prompt assembly hint (out of this crate's scope to apply).
    #[serde(default)]
    pub prompt_style: PromptStyle,
    /// Whether this model accepts a `system` role message.
    #[serde(default = "default_true")]
    pub system_role_support: bool,
    /// Hint text describing this model's thinking-tag convention, surfaced to
    /// prompt assembly.
    #[serde(default)]
    pub thinking_tag_hint: Option<String>,
}

impl Default for ModelPolicy {
    fn default() -> Self {
        Self {
            repair_tool_pairing: true,
            enforce_turn_ordering: false,
            reasoning_format: ReasoningFormat::default(),
            progress_interval: 0,
            progress_escalation: false,
            prompt_style: PromptStyle::default(),
            system_role_support: true,
            thinking_tag_hint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningFormat {
    #[default]
    ThinkTags,
    None,
    OpenAiReasoning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    #[default]
    Default,
    Concise,
    Structured,
}

fn default_max_output_chars() -> usize {
    32_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_wait_secs() -> u64 {
    2
}
fn default_compact_keep_last() -> usize {
    10
}
fn default_compaction_overhead_reserve() -> f32 {
    0.10
}
fn default_context_max_tokens() -> usize {
    128_000
}
fn default_context_warn_ratio() -> f32 {
    0.7
}
fn default_context_hard_ratio() -> f32 {
    0.85
}
fn default_loop_window_size() -> usize {
    10
}
fn default_loop_detect_threshold() -> usize {
    5
}
fn default_loop_name_threshold() -> usize {
    8
}
fn default_max_parallel_tools() -> usize {
    4
}
fn default_tool_timeout_secs() -> u64 {
    30
}

/// The full configuration surface recognized by the Agent Loop Controller
/// (SPEC §3/§6). Deserializable from YAML with per-field defaults so a
/// config file may specify only the fields it wants to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    /// Maximum output characters per tool result before deterministic,
    /// category-aware truncation (`relay_core::compact::smart_truncate`).
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// Maximum LLM-call retries on a transient error, exponential backoff.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base wait before the first retry; doubles each subsequent attempt.
    #[serde(default = "default_retry_base_wait_secs")]
    pub retry_base_wait_secs: u64,
    /// Number of most-recent non-system messages preserved verbatim by
    /// compaction.
    #[serde(default = "default_compact_keep_last")]
    pub compact_keep_last: usize,
    /// Compaction checkpoint format: `structured` or `narrative`.
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Fraction of the context window reserved for tool schemas and
    /// estimation error, subtracted from `context_hard_ratio` before
    /// comparison.
    #[serde(default = "default_compaction_overhead_reserve")]
    pub compaction_overhead_reserve: f32,
    /// Context window ceiling in tokens used by the context guard's
    /// char/4 estimator.
    #[serde(default = "default_context_max_tokens")]
    pub context_max_tokens: usize,
    /// Token-fraction at which the guard logs a warning (no action taken).
    #[serde(default = "default_context_warn_ratio")]
    pub context_warn_ratio: f32,
    /// Token-fraction at which the guard triggers compaction.
    #[serde(default = "default_context_hard_ratio")]
    pub context_hard_ratio: f32,
    /// Size of the loop detector's sliding window of recent tool calls.
    #[serde(default = "default_loop_window_size")]
    pub loop_window_size: usize,
    /// Multiplicity within the window that fires the exact-match detector.
    #[serde(default = "default_loop_detect_threshold")]
    pub loop_detect_threshold: usize,
    /// Consecutive same-name tool calls that fire the name-only detector.
    #[serde(default = "default_loop_name_threshold")]
    pub loop_name_threshold: usize,
    /// Width of the tool-execution fan-out semaphore.
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,
    /// Per-tool-invocation timeout in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Optional hard ceiling on total tokens consumed by one run.
    #[serde(default)]
    pub max_token_budget: Option<u64>,
    /// Per-model behavioral overrides, keyed by a substring matched against
    /// the active model identifier (longest match wins).
    #[serde(default)]
    pub model_policies: HashMap<String, ModelPolicy>,
    /// Deprecated loop-detection threshold, superseded by
    /// `loop_detect_threshold`/`loop_window_size`. Accepted for backward
    /// compatibility with older config files; the loader logs a warning and
    /// the loop detector never reads it.
    #[serde(default)]
    pub doom_loop: Option<u32>,
    /// System prompt override; leave `None` to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Per-step wall-clock timeout in seconds (0 = no limit).
    #[serde(default)]
    pub max_step_timeout_secs: u64,
    /// Total run wall-clock timeout in seconds (0 = no limit).
    #[serde(default)]
    pub max_run_timeout_secs: u64,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_output_chars: default_max_output_chars(),
            max_retries: default_max_retries(),
            retry_base_wait_secs: default_retry_base_wait_secs(),
            compact_keep_last: default_compact_keep_last(),
            compaction_strategy: CompactionStrategy::default(),
            compaction_overhead_reserve: default_compaction_overhead_reserve(),
            context_max_tokens: default_context_max_tokens(),
            context_warn_ratio: default_context_warn_ratio(),
            context_hard_ratio: default_context_hard_ratio(),
            loop_window_size: default_loop_window_size(),
            loop_detect_threshold: default_loop_detect_threshold(),
            loop_name_threshold: default_loop_name_threshold(),
            max_parallel_tools: default_max_parallel_tools(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_token_budget: None,
            model_policies: HashMap::new(),
            doom_loop: None,
            system_prompt: None,
            max_step_timeout_secs: 0,
            max_run_timeout_secs: 0,
        }
    }
}

impl AgentLoopConfig {
    pub fn retry_base_wait(&self) -> Duration {
        Duration::from_secs(self.retry_base_wait_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Resolve the behavioral policy for `model_id` by longest-substring
    /// match against the configured table, falling back to defaults when
    /// nothing matches.
    pub fn resolve_policy(&self, model_id: &str) -> ModelPolicy {
        self.model_policies
            .iter()
            .filter(|(token, _)| model_id.contains(token.as_str()))
            .max_by_key(|(token, _)| token.len())
            .map(|(_, policy)| policy.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Automatically approve tool invocations matching these glob patterns
    #[serde(default = "default_auto_approve_patterns")]
    pub auto_approve_patterns: Vec<String>,
    /// Block tool invocations matching these glob patterns
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
}

fn default_auto_approve_patterns() -> Vec<String> {
    vec![
        "cat *".into(),
        "ls *".into(),
        "find *".into(),
        "rg *".into(),
        "grep *".into(),
    ]
}

fn default_deny_patterns() -> Vec<String> {
    vec!["rm -rf /*".into(), "dd if=*".into()]
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: default_auto_approve_patterns(),
            deny_patterns: default_deny_patterns(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
