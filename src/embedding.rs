//! Embedding provider implementations and vector utilities.
//!
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `POST /embeddings`
//!   endpoint, one text per request.
//!
//! Also provides the vector helpers the rest of the crate relies on:
//! - [`validate_embedding`]: enforce the configured dimension and finite values
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//!
//! # Error Mapping
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → [`ProviderError::Transient`]
//! - Timeouts and connection failures → [`ProviderError::Transient`]
//! - Any other 4xx or a malformed body → [`ProviderError::Permanent`]
//!
//! Retrying is not done here; the orchestrator wraps every call in the
//! shared [`RetryPolicy`](crate::retry::RetryPolicy).

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, ProviderError};
use crate::traits::EmbeddingProvider;

/// Embedding provider using an OpenAI-compatible API.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAiEmbedder {
    /// Model name (e.g. `"text-embedding-3-small"`).
    model: String,
    /// Vector dimensionality (e.g. `256`).
    dims: usize,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    /// Create a new provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns a config error if `model` or `dims` is not set, or if
    /// `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self, PipelineError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| PipelineError::Config("embedding.model required for OpenAI provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| PipelineError::Config("embedding.dims required for OpenAI provider".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Config("OPENAI_API_KEY environment variable not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            model,
            dims,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
            "dimensions": self.dims,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = format!("embeddings API error {}: {}", status, body_text);
            // Rate limited or server error, retry
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(ProviderError::Transient(message));
            }
            return Err(ProviderError::Permanent(message));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid embeddings response: {e}")))?;
        parse_embedding_response(&json)
    }
}

/// Extract the first `data[].embedding` array.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::Permanent("invalid embeddings response: missing data[0].embedding".into()))?;

    // Non-numeric entries become NaN so validation rejects the vector.
    Ok(embedding
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32).unwrap_or(f32::NAN))
        .collect())
}

/// Create the configured provider, or `None` when embeddings are disabled.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>, PipelineError> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiEmbedder::new(config)?))),
        other => Err(PipelineError::Config(format!("Unknown embedding provider: {other}"))),
    }
}

/// Check a provider vector before it is stored.
///
/// Returns a human-readable reason on failure.
pub fn validate_embedding(vector: &[f32], dims: usize) -> Result<(), String> {
    if vector.len() != dims {
        return Err(format!(
            "embedding length mismatch: expected {}, got {}",
            dims,
            vector.len()
        ));
    }
    if let Some(idx) = vector.iter().position(|v| !v.is_finite()) {
        return Err(format!("embedding[{idx}] must be finite"));
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use window_digest::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, or zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_validate_embedding() {
        assert!(validate_embedding(&[0.1, 0.2, 0.3], 3).is_ok());
        assert!(validate_embedding(&[0.1, 0.2], 3).unwrap_err().contains("expected 3, got 2"));
        assert!(validate_embedding(&[0.1, f32::NAN, 0.3], 3).unwrap_err().contains("[1]"));
        assert!(validate_embedding(&[0.1, f32::INFINITY, 0.3], 3).is_err());
    }

    #[test]
    fn test_parse_embedding_response() {
        let json = serde_json::json!({
            "data": [{"index": 0, "embedding": [0.5, -0.25, "x"]}]
        });
        let vec = parse_embedding_response(&json).unwrap();
        assert_eq!(vec.len(), 3);
        assert_eq!(vec[0], 0.5);
        assert!(vec[2].is_nan());

        let missing = serde_json::json!({"object": "list"});
        assert!(!parse_embedding_response(&missing).unwrap_err().is_transient());
    }

    #[test]
    fn test_disabled_provider_is_none() {
        let config = EmbeddingConfig::default();
        assert!(create_provider(&config).unwrap().is_none());
    }
}
