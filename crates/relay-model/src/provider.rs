// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::{
    catalog::{InputModality, ModelCatalogEntry},
    CompletionRequest, CompletionResponse, ResponseEvent,
};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The LLM client contract. A concrete driver (OpenAI, Anthropic, a local
/// server, a test double) implements this trait; the agent loop never
/// depends on a specific provider.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// Non-streaming convenience built on top of [`Self::complete`]: drains
    /// the stream and folds it into a single accumulated response. Providers
    /// rarely need to override this; it exists so callers that do not care
    /// about incremental deltas (e.g. the compaction summarizer) can use a
    /// plain request/response shape.
    async fn generate(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let mut stream = self.complete(req).await?;
        let mut content = String::new();
        let mut tool_calls: Vec<crate::ToolCallDelta> = Vec::new();
        let mut usage = crate::Usage::default();
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(t) => content.push_str(&t),
                ResponseEvent::ThinkingDelta(_) => {}
                ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    tool_calls.push(crate::ToolCallDelta {
                        index,
                        id,
                        name,
                        arguments,
                    });
                }
                ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                } => {
                    usage = crate::Usage {
                        input_tokens,
                        output_tokens,
                        cache_read_tokens,
                        cache_write_tokens,
                    };
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(msg) => return Err(anyhow::anyhow!(msg)),
            }
        }
        Ok(CompletionResponse {
            content,
            tool_calls,
            model_used: self.model_name().to_string(),
            usage,
        })
    }

    /// List all models available from this provider.
    ///
    /// The default implementation returns only the fallback catalog entries
    /// for this provider. Override to perform a live API query.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let provider = self.name();
        let entries = crate::catalog::fallback_catalog()
            .into_iter()
            .filter(|e| e.provider == provider)
            .collect();
        Ok(entries)
    }

    /// Maximum output tokens for this provider/model combination.
    fn catalog_max_output_tokens(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.max_output_tokens)
    }

    /// Context window size for this provider/model combination.
    fn catalog_context_window(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.context_window)
    }

    /// Query the live API for the actual context window in use.
    ///
    /// Default implementation returns `None` (no live probe available).
    /// Override in providers that expose a properties/info endpoint.
    async fn probe_context_window(&self) -> Option<u32> {
        None
    }

    /// Input modalities supported by this provider/model combination.
    fn input_modalities(&self) -> Vec<InputModality> {
        crate::catalog::lookup(self.name(), self.model_name())
            .map(|e| e.input_modalities)
            .unwrap_or_else(|| vec![InputModality::Text])
    }

    /// Returns `true` if this model supports image input.
    fn supports_images(&self) -> bool {
        self.input_modalities().contains(&InputModality::Image)
    }
}
