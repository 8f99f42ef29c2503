//! LLM client abstraction for the pipeline stages.
//!
//! Provides a provider-agnostic [`LlmClient`] trait, an OpenAI-compatible
//! chat-completions implementation, and the token-budget arithmetic the
//! selector uses to bound what the LLM is allowed to see.

mod budget;
mod client;
mod types;

pub use budget::{RowBudget, TokenBudget, DEFAULT_PER_ROW_TOKENS, MIN_ROWS};
pub use client::{ChatCompletionsClient, ClientConfig, LlmClient};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, StopReason, TokenUsage,
};

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted LLM doubles shared by stage tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use sha2::{Digest, Sha256};

    use crate::error::{Error, Result};

    use super::types::{
        CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, StopReason,
        TokenUsage,
    };
    use super::LlmClient;

    /// Deterministic pseudo-embedding derived from the text content.
    /// Similar texts do not get similar vectors; tests that need semantic
    /// neighborhoods should seed the index with crafted vectors instead.
    pub(crate) fn pseudo_embedding(text: &str, dimension: usize) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut out = Vec::with_capacity(dimension);
        for i in 0..dimension {
            let byte = digest[i % digest.len()];
            let v = f32::from(byte) / 255.0 - 0.5 + (i as f32 * 1e-3);
            out.push(v);
        }
        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }

    /// LLM double answering by prompt-substring rules, deterministic under
    /// concurrent callers.
    pub(crate) struct ScriptedLlm {
        rules: Vec<(String, String)>,
        default_response: Option<String>,
        fail_completions: bool,
        fail_embeddings: bool,
        dimension: usize,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        /// Double with no rules: every completion returns the default.
        pub(crate) fn with_default(response: impl Into<String>) -> Self {
            Self {
                rules: Vec::new(),
                default_response: Some(response.into()),
                fail_completions: false,
                fail_embeddings: false,
                dimension: 8,
                calls: AtomicUsize::new(0),
            }
        }

        /// Double that fails every completion and embedding call.
        pub(crate) fn failing() -> Self {
            Self {
                rules: Vec::new(),
                default_response: None,
                fail_completions: true,
                fail_embeddings: true,
                dimension: 8,
                calls: AtomicUsize::new(0),
            }
        }

        /// Add a (prompt substring → response) rule.
        pub(crate) fn with_rule(
            mut self,
            needle: impl Into<String>,
            response: impl Into<String>,
        ) -> Self {
            self.rules.push((needle.into(), response.into()));
            self
        }

        /// Embedding dimension returned by [`LlmClient::embed`].
        pub(crate) fn with_dimension(mut self, dimension: usize) -> Self {
            self.dimension = dimension;
            self
        }

        /// Number of completion calls made so far.
        pub(crate) fn completion_calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_completions {
                return Err(Error::llm_api("scripted", "scripted failure"));
            }

            let haystack = {
                let mut parts: Vec<&str> = Vec::new();
                if let Some(system) = &request.system {
                    parts.push(system);
                }
                for m in &request.messages {
                    parts.push(&m.content);
                }
                parts.join("\n")
            };

            let content = self
                .rules
                .iter()
                .find(|(needle, _)| haystack.contains(needle))
                .map(|(_, response)| response.clone())
                .or_else(|| self.default_response.clone())
                .ok_or_else(|| Error::llm_api("scripted", "no rule matched"))?;

            Ok(CompletionResponse {
                content,
                model: "scripted".to_string(),
                stop_reason: Some(StopReason::EndTurn),
                usage: TokenUsage::default(),
                timestamp: Utc::now(),
            })
        }

        async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
            if self.fail_embeddings {
                return Err(Error::llm_api("scripted", "scripted embed failure"));
            }
            Ok(EmbeddingResponse {
                embeddings: request
                    .texts
                    .iter()
                    .map(|t| pseudo_embedding(t, self.dimension))
                    .collect(),
                model: "scripted-embed".to_string(),
                input_tokens: 0,
            })
        }

        fn provider(&self) -> &str {
            "scripted"
        }
    }
}
