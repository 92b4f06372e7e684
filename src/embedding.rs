//! Embedding capability and providers.
//!
//! Defines the [`Embedder`] trait consumed by the index build and the
//! retriever, and concrete implementations:
//! - **[`DisabledEmbedder`]**: fails every call; used when no provider is configured.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings` on the OpenAI API (or a compatible URL).
//! - **[`OllamaEmbedder`]**: `POST /api/embed` on a local Ollama instance.
//!
//! Providers make exactly one HTTP request per call. Timeouts and retries
//! are applied by the caller through [`crate::retry::with_retry`], so every
//! capability shares one policy.
//!
//! Also provides the vector helpers used by the index and the cache:
//! - [`cosine_similarity`]
//! - [`vec_to_blob`] / [`blob_to_vec`] for SQLite BLOB storage

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::CapabilityError;

const CAPABILITY: &str = "embed";

/// `embed(text) -> vector`.
///
/// Every vector an embedder returns has exactly [`Embedder::dims`] entries,
/// so prose and code scores are comparable.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, stored next to cached vectors.
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

/// Build the embedder selected by `[embedding] provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
        Err(CapabilityError::Disabled {
            capability: CAPABILITY,
        })
    }
}

// ============ OpenAI ============

/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: String,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: reqwest::Client::new(),
            url: format!("{}/embeddings", base.trim_end_matches('/')),
            model,
            dims,
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        debug!(url = %self.url, model = %self.model, chars = text.len(), "embedding request");
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let json = post_json(
            self.client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body),
        )
        .await?;
        let vec = parse_openai_response(&json)?;
        check_dims(vec, self.dims)
    }
}

/// Extract `data[0].embedding`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>, CapabilityError> {
    json.get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .map(|values| values_to_vec(values))
        .ok_or_else(|| malformed("missing data[0].embedding"))
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: reqwest::Client::new(),
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let json = post_json(self.client.post(&self.url).json(&body)).await?;
        let vec = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .and_then(|e| e.first())
            .and_then(|e| e.as_array())
            .map(|values| values_to_vec(values))
            .ok_or_else(|| malformed("missing embeddings[0]"))?;
        check_dims(vec, self.dims)
    }
}

// ============ Shared helpers ============

async fn post_json(request: reqwest::RequestBuilder) -> Result<serde_json::Value, CapabilityError> {
    let response = request
        .header("Content-Type", "application/json")
        .send()
        .await
        .map_err(|e| CapabilityError::Transport {
            capability: CAPABILITY,
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CapabilityError::Status {
            capability: CAPABILITY,
            status: status.as_u16(),
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|e| malformed(&format!("invalid JSON body: {}", e)))
}

fn values_to_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

fn check_dims(vec: Vec<f32>, dims: usize) -> Result<Vec<f32>, CapabilityError> {
    if vec.len() != dims {
        return Err(CapabilityError::Malformed {
            capability: CAPABILITY,
            message: format!("expected {} dimensions, got {}", dims, vec.len()),
        });
    }
    Ok(vec)
}

fn malformed(message: &str) -> CapabilityError {
    CapabilityError::Malformed {
        capability: CAPABILITY,
        message: message.to_string(),
    }
}

/// Encode a vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Reverse of [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
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
