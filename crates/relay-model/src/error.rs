// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed classification of errors returned by a [`crate::ModelProvider`].
//!
//! Callers (the agent loop's retry logic) must not string-match provider
//! error text themselves — the provider driver is responsible for mapping
//! its own wire-level errors into one of these variants.

use regex::Regex;
use std::sync::OnceLock;

/// Classified failure from a model provider call.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Rate limit, timeout, 5xx, or connection failure — safe to retry with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Authentication failure, invalid request, or any error retrying cannot fix.
    #[error("fatal provider error: {0}")]
    Fatal(String),
    /// The request exceeded the model's context window. Triggers compaction
    /// rather than a blind retry.
    #[error("context window exceeded{}: {message}", n_ctx.map(|n| format!(" (n_ctx={n})")).unwrap_or_default())]
    ContextOverflow {
        /// The context window size reported by the provider, if parseable.
        n_ctx: Option<u32>,
        message: String,
    },
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

fn n_ctx_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:n_ctx|context length|context window)[^0-9]{0,20}(\d{3,7})").unwrap()
    })
}

/// Heuristically classify a raw provider error string.
///
/// Used by driver implementations that only have a string to work with (most
/// HTTP-based APIs return prose error bodies rather than typed codes). Drivers
/// with structured error responses should construct [`ModelError`] variants
/// directly instead of round-tripping through this function.
pub fn classify_provider_error(raw: &str) -> ModelError {
    let lower = raw.to_ascii_lowercase();

    let overflow_markers = [
        "context_length_exceeded",
        "context length",
        "context window",
        "maximum context length",
        "too many tokens",
        "n_ctx",
    ];
    if overflow_markers.iter().any(|m| lower.contains(m)) {
        let n_ctx = n_ctx_pattern()
            .captures(raw)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());
        return ModelError::ContextOverflow {
            n_ctx,
            message: raw.to_string(),
        };
    }

    let transient_markers = [
        "rate limit",
        "429",
        "timeout",
        "timed out",
        "503",
        "502",
        "500",
        "overloaded",
        "connection reset",
        "connection refused",
    ];
    if transient_markers.iter().any(|m| lower.contains(m)) {
        return ModelError::Transient(raw.to_string());
    }

    ModelError::Fatal(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_as_transient() {
        let e = classify_provider_error("429 Too Many Requests: rate limit exceeded");
        assert!(matches!(e, ModelError::Transient(_)));
        assert!(e.is_retryable());
    }

    #[test]
    fn classifies_timeout_as_transient() {
        let e = classify_provider_error("request timed out after 30s");
        assert!(matches!(e, ModelError::Transient(_)));
    }

    #[test]
    fn classifies_server_error_as_transient() {
        let e = classify_provider_error("503 Service Unavailable");
        assert!(matches!(e, ModelError::Transient(_)));
    }

    #[test]
    fn classifies_context_overflow_and_extracts_n_ctx() {
        let e = classify_provider_error(
            "This model's maximum context length is 131072 tokens, you requested 140000",
        );
        match e {
            ModelError::ContextOverflow { n_ctx, .. } => assert_eq!(n_ctx, Some(131072)),
            other => panic!("expected ContextOverflow, got {other:?}"),
        }
    }

    #[test]
    fn classifies_context_overflow_without_parseable_n_ctx() {
        let e = classify_provider_error("context_length_exceeded");
        assert!(matches!(e, ModelError::ContextOverflow { n_ctx: None, .. }));
    }

    #[test]
    fn classifies_auth_error_as_fatal() {
        let e = classify_provider_error("401 Unauthorized: invalid API key");
        assert!(matches!(e, ModelError::Fatal(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn classifies_unknown_error_as_fatal_by_default() {
        let e = classify_provider_error("something entirely unexpected happened");
        assert!(matches!(e, ModelError::Fatal(_)));
    }

    #[test]
    fn context_overflow_is_not_retryable() {
        let e = classify_provider_error("context window exceeded");
        assert!(!e.is_retryable());
    }

    #[test]
    fn display_includes_n_ctx_when_present() {
        let e = ModelError::ContextOverflow {
            n_ctx: Some(8192),
            message: "too long".into(),
        };
        assert!(e.to_string().contains("8192"));
    }
}
