use crate::error::{RagError, Result};
use crate::prefix::{EmbeddingPrefixConfig, TextRole};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts. Prefix resolution happens before this call;
    /// implementations only need to merge any out-of-band prefix parameters.
    async fn embed(&self, texts: &[String], role: TextRole) -> Result<Vec<Vec<f32>>>;
}

/// Embedder backed by an OpenAI-style `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    prefix: Option<EmbeddingPrefixConfig>,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        prefix: Option<EmbeddingPrefixConfig>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            dimensions,
            prefix,
            api_key,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String], role: TextRole) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = json!({
            "model": &self.model,
            "input": texts,
        });
        if let Some(prefix) = &self.prefix {
            for (name, value) in prefix.api_params(role) {
                body[name] = Value::String(value);
            }
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::PAYLOAD_TOO_LARGE || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RagError::transient("embeddings", status.to_string()));
        }
        if !status.is_success() {
            return Err(RagError::BackendResponse {
                backend: "embeddings".to_string(),
                details: status.to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let data = parsed
            .pointer("/data")
            .and_then(Value::as_array)
            .ok_or_else(|| RagError::BackendResponse {
                backend: "embeddings".to_string(),
                details: "missing data array".to_string(),
            })?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .pointer("/embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| RagError::BackendResponse {
                    backend: "embeddings".to_string(),
                    details: "missing embedding field".to_string(),
                })?
                .iter()
                .filter_map(Value::as_f64)
                .map(|value| value as f32)
                .collect::<Vec<f32>>();
            vectors.push(embedding);
        }

        if vectors.len() != texts.len() {
            return Err(RagError::BackendResponse {
                backend: "embeddings".to_string(),
                details: format!("asked for {} vectors, got {}", texts.len(), vectors.len()),
            });
        }

        Ok(vectors)
    }
}

/// Deterministic character-ngram embedder for tests and offline runs.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    pub dimensions: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashEmbedder {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String], _role: TextRole) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let texts = vec!["hydraulic pressure and flow".to_string()];
        let first = embedder.embed(&texts, TextRole::Document).await.unwrap();
        let second = embedder.embed(&texts, TextRole::Document).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn hash_embedder_outputs_expected_length() {
        let embedder = HashEmbedder { dimensions: 32 };
        let vectors = embedder
            .embed(&["abc".to_string()], TextRole::Query)
            .await
            .unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 32);
    }
}
