//! Embedding provider abstraction, implementations, and the batching Embedder.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! [`Embedder`] sits in front of a provider and turns an ordered list of
//! fragment texts into exactly one vector of dimension `D` per text:
//!
//! - blank texts are never submitted and get a zero vector
//! - texts are truncated to `max_input_chars` before submission
//! - non-blank texts are sent in batches of `batch_size`, one after another
//! - returned vectors are padded with zeros or truncated to `D`
//! - a failed batch is logged and its texts get zero vectors; the
//!   remaining batches still run
//!
//! Also provides the BLOB codec used to persist vectors in SQLite:
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`]: decode a BLOB back into a `Vec<f32>`
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use topic_discovery::config::EmbeddingConfig;
//! # use topic_discovery::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! Provider calls are made once, bounded by `timeout_secs`; there is no
//! retry.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;

/// Trait for embedding providers.
///
/// `embed` receives at most one batch of texts and must return one vector
/// per text in input order, or an error for the whole batch. Vector length
/// may differ from [`dims`](EmbeddingProvider::dims); the [`Embedder`]
/// corrects it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the expected embedding dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed one batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` is not set or `OPENAI_API_KEY` is not in
    /// the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url,
                    e
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());

    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Embedder ============

/// Result of embedding an ordered list of texts.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutcome {
    /// One vector of length `D` per input text, in input order.
    pub vectors: Vec<Vec<f32>>,
    /// Number of non-blank texts.
    pub embeddable: usize,
    /// Batches submitted to the provider.
    pub batches: usize,
    pub failed_batches: usize,
    /// Vectors whose returned length differed from `D`.
    pub resized: usize,
    /// Message of the most recent batch failure.
    pub last_error: Option<String>,
}

impl EmbeddingOutcome {
    /// True when at least one batch was submitted and none succeeded.
    pub fn all_failed(&self) -> bool {
        self.batches > 0 && self.failed_batches == self.batches
    }
}

pub struct Embedder<'a> {
    provider: &'a dyn EmbeddingProvider,
    dims: usize,
    batch_size: usize,
    max_input_chars: usize,
}

impl<'a> Embedder<'a> {
    pub fn new(provider: &'a dyn EmbeddingProvider, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_input_chars: config.max_input_chars,
        }
    }

    pub async fn embed_all(&self, texts: &[String]) -> EmbeddingOutcome {
        let mut outcome = EmbeddingOutcome {
            vectors: vec![vec![0.0; self.dims]; texts.len()],
            ..Default::default()
        };

        let pending: Vec<(usize, String)> = texts
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.trim().is_empty())
            .map(|(i, t)| (i, truncate_chars(t, self.max_input_chars).to_string()))
            .collect();
        outcome.embeddable = pending.len();

        let truncated = texts
            .iter()
            .filter(|t| t.chars().count() > self.max_input_chars)
            .count();
        if truncated > 0 {
            debug!(
                truncated,
                max_chars = self.max_input_chars,
                "truncated embedding inputs"
            );
        }

        for (batch, chunk) in pending.chunks(self.batch_size).enumerate() {
            outcome.batches += 1;
            let batch_texts: Vec<String> = chunk.iter().map(|(_, t)| t.clone()).collect();

            let result = self.provider.embed(&batch_texts).await.and_then(|vectors| {
                if vectors.len() != batch_texts.len() {
                    bail!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        batch_texts.len()
                    );
                }
                Ok(vectors)
            });

            match result {
                Ok(vectors) => {
                    for ((index, _), raw) in chunk.iter().zip(vectors) {
                        if raw.len() != self.dims {
                            outcome.resized += 1;
                        }
                        outcome.vectors[*index] = normalize_dimension(raw, self.dims);
                    }
                    debug!(batch, size = chunk.len(), "embedded batch");
                }
                Err(e) => {
                    warn!(
                        batch,
                        size = chunk.len(),
                        error = %e,
                        "embedding batch failed; using zero vectors"
                    );
                    outcome.failed_batches += 1;
                    outcome.last_error = Some(e.to_string());
                }
            }
        }

        if outcome.resized > 0 {
            warn!(
                resized = outcome.resized,
                dims = self.dims,
                "provider returned vectors of unexpected dimension; padded or truncated"
            );
        }

        outcome
    }
}

/// Pad with zeros or truncate to exactly `dims` entries.
pub fn normalize_dimension(mut vector: Vec<f32>, dims: usize) -> Vec<f32> {
    vector.resize(dims, 0.0);
    vector
}

/// Prefix of `text` with at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use topic_discovery::embedding::{vec_to_blob, blob_to_vec};
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns `[len(text), 1, 1, ...]` of a fixed length; fails chosen calls.
    struct ScriptedProvider {
        output_len: usize,
        fail_calls: Vec<usize>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedProvider {
        fn new(output_len: usize) -> Self {
            Self {
                output_len,
                fail_calls: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            self.output_len
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(texts.to_vec());
                calls.len() - 1
            };
            if self.fail_calls.contains(&call) {
                bail!("scripted failure on call {}", call);
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![1.0; self.output_len];
                    v[0] = t.chars().count() as f32;
                    v
                })
                .collect())
        }
    }

    fn config(dims: usize, batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dims,
            batch_size,
            max_input_chars: 10,
            ..Default::default()
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_output_always_has_configured_dimension() {
        for output_len in [2, 4, 9] {
            let provider = ScriptedProvider::new(output_len);
            let cfg = config(4, 10);
            let outcome = Embedder::new(&provider, &cfg)
                .embed_all(&texts(&["a", "bb"]))
                .await;
            assert!(outcome.vectors.iter().all(|v| v.len() == 4));
            assert_eq!(outcome.resized, if output_len == 4 { 0 } else { 2 });
        }
    }

    #[tokio::test]
    async fn test_short_vectors_are_zero_padded() {
        let provider = ScriptedProvider::new(2);
        let cfg = config(4, 10);
        let outcome = Embedder::new(&provider, &cfg)
            .embed_all(&texts(&["abc"]))
            .await;
        assert_eq!(outcome.vectors[0], vec![3.0, 1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_blank_texts_skipped_and_zero_filled() {
        let provider = ScriptedProvider::new(3);
        let cfg = config(3, 10);
        let outcome = Embedder::new(&provider, &cfg)
            .embed_all(&texts(&["one", "   ", "three"]))
            .await;
        assert_eq!(outcome.embeddable, 2);
        assert_eq!(outcome.vectors[1], vec![0.0, 0.0, 0.0]);
        assert_eq!(outcome.vectors[0][0], 3.0);
        assert_eq!(outcome.vectors[2][0], 5.0);
        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], texts(&["one", "three"]));
    }

    #[tokio::test]
    async fn test_inputs_truncated_before_submission() {
        let provider = ScriptedProvider::new(3);
        let cfg = config(3, 10);
        let long = "é".repeat(25);
        let outcome = Embedder::new(&provider, &cfg)
            .embed_all(&[long])
            .await;
        assert_eq!(outcome.vectors[0][0], 10.0);
    }

    #[tokio::test]
    async fn test_batches_submitted_in_order() {
        let provider = ScriptedProvider::new(3);
        let cfg = config(3, 2);
        let input = texts(&["a", "bb", "ccc", "dddd", "eeeee"]);
        let outcome = Embedder::new(&provider, &cfg).embed_all(&input).await;
        assert_eq!(outcome.batches, 3);
        let firsts: Vec<f32> = outcome.vectors.iter().map(|v| v[0]).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let sizes: Vec<usize> = provider.calls.lock().unwrap().iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_failed_batch_zero_filled_siblings_kept() {
        let provider = ScriptedProvider {
            fail_calls: vec![1],
            ..ScriptedProvider::new(3)
        };
        let cfg = config(3, 2);
        let input = texts(&["a", "bb", "ccc", "dddd", "eeeee"]);
        let outcome = Embedder::new(&provider, &cfg).embed_all(&input).await;
        assert_eq!(outcome.vectors.len(), 5);
        assert_eq!(outcome.failed_batches, 1);
        assert!(!outcome.all_failed());
        assert_eq!(outcome.vectors[2], vec![0.0; 3]);
        assert_eq!(outcome.vectors[3], vec![0.0; 3]);
        assert_eq!(outcome.vectors[4][0], 5.0);
        assert!(outcome.last_error.unwrap().contains("call 1"));
    }

    #[tokio::test]
    async fn test_disabled_provider_fails_every_batch() {
        let cfg = config(3, 2);
        let outcome = Embedder::new(&DisabledProvider, &cfg)
            .embed_all(&texts(&["a", "b", "c"]))
            .await;
        assert_eq!(outcome.batches, 2);
        assert!(outcome.all_failed());
        assert!(outcome.vectors.iter().all(|v| v == &vec![0.0; 3]));
    }

    #[tokio::test]
    async fn test_no_embeddable_texts_submits_nothing() {
        let provider = ScriptedProvider::new(3);
        let cfg = config(3, 2);
        let outcome = Embedder::new(&provider, &cfg)
            .embed_all(&texts(&["", " "]))
            .await;
        assert_eq!(outcome.batches, 0);
        assert!(!outcome.all_failed());
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_normalize_dimension() {
        assert_eq!(normalize_dimension(vec![1.0], 3), vec![1.0, 0.0, 0.0]);
        assert_eq!(normalize_dimension(vec![1.0, 2.0, 3.0, 4.0], 2), vec![1.0, 2.0]);
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0, 2.0]},
                {"index": 0, "embedding": [1.0, 1.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.25]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.25]]);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let cfg = EmbeddingConfig {
            provider: "bogus".to_string(),
            ..Default::default()
        };
        assert!(create_provider(&cfg).is_err());
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }
}
