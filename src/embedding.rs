//! Embedding provider abstraction and implementations.
//!
//! - **[`OpenAIProvider`]** calls an OpenAI-compatible `/embeddings`
//!   endpoint, one request per batch of uncached texts.
//! - **[`HashProvider`]** derives vectors from SHA-256 digests. It needs no
//!   network access and is fully deterministic, which makes it the
//!   fallback when no API credential is configured and the provider used
//!   by tests.
//!
//! Also provides the vector utilities the store needs:
//! [`cosine_similarity`], [`vec_to_blob`] and [`blob_to_vec`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{IndexSettings, ProviderKind};
use crate::error::{Error, Result};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Model name reported by [`HashProvider`].
pub const HASH_MODEL: &str = "hash-sha256";

/// Dimensionality of [`HashProvider`] vectors.
pub const HASH_DIMS: usize = 64;

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier. Part of every stored hash, so switching models
    /// invalidates stored and cached vectors.
    fn model_name(&self) -> &str;

    /// Embed `texts`, returning one vector per input in the same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Pick a provider according to the index settings.
///
/// `auto` uses the remote API when the credential variable is set and the
/// hash provider otherwise.
pub fn create_provider(settings: &IndexSettings) -> Result<Box<dyn EmbeddingProvider>> {
    match resolve_kind(settings) {
        ProviderKind::Openai => Ok(Box::new(OpenAIProvider::new(settings)?)),
        _ => Ok(Box::new(HashProvider::new())),
    }
}

/// Settle `auto` into a concrete provider kind.
fn resolve_kind(settings: &IndexSettings) -> ProviderKind {
    match settings.provider {
        ProviderKind::Auto => {
            let has_key = std::env::var(&settings.api_key_env)
                .map(|k| !k.trim().is_empty())
                .unwrap_or(false);
            if has_key {
                ProviderKind::Openai
            } else {
                tracing::info!(
                    env = %settings.api_key_env,
                    "no embedding credential found, using hash embeddings"
                );
                ProviderKind::Hash
            }
        }
        kind => kind,
    }
}

// ============ Lazy Provider ============

/// Defers building the real provider until the first `embed` call.
///
/// Store operations that never embed (listing, validated queries, cache
/// maintenance) then work without a credential. The model name is known
/// up front, so stored hashes stay comparable.
pub struct LazyProvider {
    settings: IndexSettings,
    model: String,
    inner: tokio::sync::OnceCell<Box<dyn EmbeddingProvider>>,
}

impl LazyProvider {
    pub fn new(settings: &IndexSettings) -> Self {
        let model = match resolve_kind(settings) {
            ProviderKind::Openai => settings.embedding_model.clone(),
            _ => HASH_MODEL.to_string(),
        };
        Self {
            settings: settings.clone(),
            model,
            inner: tokio::sync::OnceCell::new(),
        }
    }

    /// Whether the underlying provider has been built.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized()
    }
}

#[async_trait]
impl EmbeddingProvider for LazyProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let provider = self
            .inner
            .get_or_try_init(|| async { create_provider(&self.settings) })
            .await?;
        provider.embed(texts).await
    }
}

// ============ OpenAI Provider ============

/// Embedding provider backed by the OpenAI embeddings API.
///
/// Vectors are cached in memory for the lifetime of the provider, keyed by
/// a SHA-256 digest of the input text. Exactly one HTTP attempt is made
/// per `embed` call.
pub struct OpenAIProvider {
    model: String,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl OpenAIProvider {
    /// Fails if the credential variable named by `api_key_env` is unset.
    pub fn new(settings: &IndexSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                Error::EmbeddingProvider(format!(
                    "{} environment variable not set",
                    settings.api_key_env
                ))
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(settings.timeout))
            .build()
            .map_err(|e| Error::EmbeddingProvider(e.to_string()))?;

        Ok(Self {
            model: settings.embedding_model.clone(),
            api_base: settings
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn request_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_base);
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::EmbeddingProvider(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::EmbeddingProvider(format!(
                "embeddings API returned {}: {}",
                status,
                text.trim()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingProvider(format!("invalid response: {}", e)))?;
        let vectors = parse_openai_response(&json)?;
        if vectors.len() != inputs.len() {
            return Err(Error::EmbeddingProvider(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| hash_text(t)).collect();

        let missing: Vec<(String, String)> = {
            let cache = self
                .cache
                .lock()
                .map_err(|_| Error::EmbeddingProvider("embedding cache lock poisoned".into()))?;
            let mut seen = std::collections::HashSet::new();
            keys.iter()
                .zip(texts)
                .filter(|(k, _)| !cache.contains_key(*k) && seen.insert((*k).clone()))
                .map(|(k, t)| (k.clone(), t.clone()))
                .collect()
        };

        if !missing.is_empty() {
            tracing::debug!(count = missing.len(), model = %self.model, "requesting embeddings");
            let inputs: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.request_embeddings(&inputs).await?;
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| Error::EmbeddingProvider("embedding cache lock poisoned".into()))?;
            for ((key, _), vector) in missing.into_iter().zip(vectors) {
                cache.insert(key, vector);
            }
        }

        let cache = self
            .cache
            .lock()
            .map_err(|_| Error::EmbeddingProvider("embedding cache lock poisoned".into()))?;
        keys.iter()
            .map(|k| {
                cache
                    .get(k)
                    .cloned()
                    .ok_or_else(|| Error::EmbeddingProvider("embedding missing from cache".into()))
            })
            .collect()
    }
}

/// Extract `data[].embedding`, ordered by each item's `index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::EmbeddingProvider("invalid response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::EmbeddingProvider("invalid response: missing embedding".into()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Hash Provider ============

/// Deterministic offline provider.
///
/// Each vector is built from SHA-256 blocks of `counter || text`, with
/// every digest byte mapped to `(b - 127.5) / 127.5`.
#[derive(Debug, Default, Clone)]
pub struct HashProvider;

impl HashProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn embed_one(text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(HASH_DIMS);
        let mut counter: u32 = 0;
        while out.len() < HASH_DIMS {
            let mut hasher = Sha256::new();
            hasher.update(counter.to_le_bytes());
            hasher.update(text.as_bytes());
            for byte in hasher.finalize() {
                if out.len() == HASH_DIMS {
                    break;
                }
                out.push((byte as f32 - 127.5) / 127.5);
            }
            counter += 1;
        }
        out
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        HASH_MODEL
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

/// Hex SHA-256 of a string.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
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
/// of different lengths and zero-magnitude vectors.
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

    (dot / denom).clamp(-1.0, 1.0)
}
