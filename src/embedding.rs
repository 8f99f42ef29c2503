//! Embedding service over an injected LLM client.
//!
//! Wraps the raw embed call with lazy readiness, input validation, secret
//! stripping, and cosine normalization. Vectors are deterministic for a
//! fixed model version, so index entries and queries embed consistently.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::llm::{EmbeddingRequest, LlmClient};
use crate::redact::SecretRedactor;

/// Maximum input length accepted for a single embedding text.
const MAX_INPUT_CHARS: usize = 8_192;

/// Cosine similarity between two vectors. Returns 0.0 on dimension mismatch
/// or zero-magnitude input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dense-vector embedding service for tool index entries and queries.
pub struct EmbeddingService {
    client: Arc<dyn LlmClient>,
    model: Option<String>,
    redactor: SecretRedactor,
    /// Vector dimension recorded on the first successful call
    dimension: RwLock<Option<usize>>,
}

impl EmbeddingService {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            model: None,
            redactor: SecretRedactor::new(),
            dimension: RwLock::new(None),
        }
    }

    /// Pin a specific embedding model instead of the client default.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// The vector dimension, known after the first successful call.
    pub async fn dimension(&self) -> Option<usize> {
        *self.dimension.read().await
    }

    /// Embed a batch of texts, one normalized vector per input in order.
    ///
    /// # Errors
    /// - [`Error::Validation`] when an input exceeds the length cap
    /// - [`Error::LlmApi`] when the model is unavailable (recoverable on retry)
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        for t in texts {
            if t.chars().count() > MAX_INPUT_CHARS {
                return Err(Error::validation(format!(
                    "input_too_long: {} chars exceeds {MAX_INPUT_CHARS}",
                    t.chars().count()
                )));
            }
        }

        // Queries must reach the model as plain text with credentials stripped.
        let cleaned: Vec<String> = texts.iter().map(|t| self.redactor.redact(t)).collect();

        let mut request = EmbeddingRequest::new(cleaned);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let response = self.client.embed(request).await?;
        if response.embeddings.len() != texts.len() {
            return Err(Error::llm_api(
                self.client.provider(),
                format!(
                    "embedding count mismatch: sent {}, got {}",
                    texts.len(),
                    response.embeddings.len()
                ),
            ));
        }

        let mut vectors = response.embeddings;
        for v in &mut vectors {
            l2_normalize(v);
        }

        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        if vectors.iter().any(|v| v.len() != dim) || dim == 0 {
            return Err(Error::llm_api(
                self.client.provider(),
                "inconsistent embedding dimensions",
            ));
        }

        let mut recorded = self.dimension.write().await;
        match *recorded {
            None => *recorded = Some(dim),
            Some(expected) if expected != dim => {
                return Err(Error::llm_api(
                    self.client.provider(),
                    format!("embedding dimension changed: {expected} -> {dim}"),
                ));
            }
            Some(_) => {}
        }

        Ok(vectors)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Internal("empty embedding batch result".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![0.6, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_dimension_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_embed_batch_normalizes_and_records_dimension() {
        let svc = EmbeddingService::new(Arc::new(ScriptedLlm::with_default("").with_dimension(16)));
        assert_eq!(svc.dimension().await, None);

        let vectors = svc
            .embed_batch(&["list files".to_string(), "restart service".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        for v in &vectors {
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
        assert_eq!(svc.dimension().await, Some(16));
    }

    #[tokio::test]
    async fn test_embed_query_deterministic() {
        let svc = EmbeddingService::new(Arc::new(ScriptedLlm::with_default("")));
        let a = svc.embed_query("check disk space").await.unwrap();
        let b = svc.embed_query("check disk space").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_input_too_long_rejected() {
        let svc = EmbeddingService::new(Arc::new(ScriptedLlm::with_default("")));
        let long = "x".repeat(MAX_INPUT_CHARS + 1);
        let err = svc.embed_batch(&[long]).await.unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let svc = EmbeddingService::new(Arc::new(ScriptedLlm::failing()));
        let err = svc.embed_query("anything").await.unwrap_err();
        assert_eq!(err.code(), "llm_error");
    }
}
