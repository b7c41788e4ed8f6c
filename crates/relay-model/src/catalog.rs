// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: metadata a [`crate::ModelProvider`] may report about
//! itself (context window, output cap, supported modalities).
//!
//! Concrete provider drivers are an external collaborator (out of scope for
//! this crate); this module only defines the shape of catalog metadata and a
//! tiny in-memory fallback table used by the mock provider and by tests.

use serde::{Deserialize, Serialize};

/// Input modalities supported by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

fn default_input_modalities() -> Vec<InputModality> {
    // Conservative default: text only. Vision-capable providers must
    // explicitly report `image` via `ModelProvider::input_modalities`.
    vec![InputModality::Text]
}

/// Metadata for a single model, as reported by a provider or looked up from
/// the fallback table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "gpt-4o", "claude-opus-4-6")
    pub id: String,
    /// Human-readable display name
    pub name: String,
    /// Provider identifier: "openai" | "anthropic" | "mock"
    pub provider: String,
    /// Total context window in tokens (input + output)
    pub context_window: u32,
    /// Maximum output tokens per completion
    pub max_output_tokens: u32,
    /// Short description
    #[serde(default)]
    pub description: String,
    /// Supported input modalities. Defaults to `[text]`.
    #[serde(default = "default_input_modalities")]
    pub input_modalities: Vec<InputModality>,
}

impl ModelCatalogEntry {
    /// Return `true` if the model can accept image input.
    pub fn supports_images(&self) -> bool {
        self.input_modalities.contains(&InputModality::Image)
    }
}

/// A minimal fallback table covering a handful of well-known models.
///
/// This is intentionally small: real provider drivers live outside this
/// crate and are expected to report their own catalog entries via
/// [`crate::ModelProvider::catalog_context_window`] /
/// `catalog_max_output_tokens`. This table exists so `ModelPolicy`
/// resolution and tests have sane defaults when a provider does not.
pub fn fallback_catalog() -> Vec<ModelCatalogEntry> {
    vec![
        ModelCatalogEntry {
            id: "gpt-4o".into(),
            name: "GPT-4o".into(),
            provider: "openai".into(),
            context_window: 128_000,
            max_output_tokens: 16_384,
            description: "OpenAI general-purpose multimodal model".into(),
            input_modalities: vec![InputModality::Text, InputModality::Image],
        },
        ModelCatalogEntry {
            id: "claude-opus-4-6".into(),
            name: "Claude Opus".into(),
            provider: "anthropic".into(),
            context_window: 200_000,
            max_output_tokens: 8_192,
            description: "Anthropic flagship reasoning model".into(),
            input_modalities: vec![InputModality::Text, InputModality::Image],
        },
        ModelCatalogEntry {
            id: "mock-model".into(),
            name: "Mock".into(),
            provider: "mock".into(),
            context_window: 32_000,
            max_output_tokens: 4_096,
            description: "Deterministic in-process test model".into(),
            input_modalities: vec![InputModality::Text],
        },
    ]
}

/// Look up a single model by provider and id (or name) in the fallback table.
pub fn lookup(provider: &str, model_id: &str) -> Option<ModelCatalogEntry> {
    fallback_catalog()
        .into_iter()
        .find(|e| e.provider == provider && (e.id == model_id || e.name == model_id))
}

/// Look up the context window for a model. Falls back to `default` if not in the table.
pub fn context_window(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id)
        .map(|e| e.context_window)
        .unwrap_or(default)
}

/// Look up the max output tokens for a model. Falls back to `default` if not in the table.
pub fn max_output_tokens(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id)
        .map(|e| e.max_output_tokens)
        .unwrap_or(default)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_catalog_is_non_empty() {
        assert!(!fallback_catalog().is_empty());
    }

    #[test]
    fn gpt4o_supports_images() {
        let entry = lookup("openai", "gpt-4o").unwrap();
        assert!(entry.supports_images());
    }

    #[test]
    fn lookup_unknown_model_returns_none() {
        assert!(lookup("openai", "nonexistent-model-xyz").is_none());
    }

    #[test]
    fn context_window_fallback_used_when_unknown() {
        assert_eq!(context_window("openai", "no-such-model", 4096), 4096);
    }

    #[test]
    fn mock_model_is_text_only() {
        let entry = lookup("mock", "mock-model").unwrap();
        assert!(!entry.supports_images());
    }
}
