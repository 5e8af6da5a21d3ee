//! Embeddings provider: HTTP client behind a trait, with a KV cache.
//!
//! Two encoding modes: `realtime` (float16-precision 768-d, for queries)
//! and `deep` (for documents and memories). Results are cached in the KV
//! store for 15 minutes, keyed by SHA-256 of the text.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use mira_domain::{Error, Result};
use mira_kv::{KvStore, KEY_EMBEDDING_DOC, KEY_EMBEDDING_QUERY};

pub const EMBEDDING_DIM: usize = 768;

#[async_trait]
pub trait Embeddings: Send + Sync {
    /// Query-mode encoding (realtime path).
    async fn encode_realtime(&self, text: &str) -> Result<Vec<f32>>;

    /// Document-mode encoding (deep path).
    async fn encode_deep(&self, text: &str) -> Result<Vec<f32>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Client for the embeddings service's `POST /encode` endpoint.
pub struct HttpEmbeddings {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EncodeResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbeddings {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Infrastructure(format!("http client: {e}")))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    async fn encode(&self, text: &str, mode: &str) -> Result<Vec<f32>> {
        let url = format!("{}/encode", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({"texts": [text], "mode": mode}))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout("embeddings request timed out".into())
                } else {
                    Error::Upstream { service: "embeddings".into(), message: e.to_string() }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                service: "embeddings".into(),
                message: format!("HTTP {} - {}", status.as_u16(), body),
            });
        }

        let parsed: EncodeResponse = resp
            .json()
            .await
            .map_err(|e| Error::Upstream { service: "embeddings".into(), message: e.to_string() })?;
        let embedding = parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Upstream {
                service: "embeddings".into(),
                message: "empty embeddings response".into(),
            })?;
        if embedding.len() != EMBEDDING_DIM {
            return Err(Error::Upstream {
                service: "embeddings".into(),
                message: format!("expected {EMBEDDING_DIM}-d embedding, got {}", embedding.len()),
            });
        }
        Ok(embedding)
    }
}

#[async_trait]
impl Embeddings for HttpEmbeddings {
    async fn encode_realtime(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text, "realtime").await
    }

    async fn encode_deep(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text, "deep").await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KV cache wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Caches embeddings in the KV store, keyed by SHA-256 of the text.
pub struct CachedEmbeddings {
    inner: Arc<dyn Embeddings>,
    kv: Arc<KvStore>,
    ttl_secs: u64,
}

impl CachedEmbeddings {
    pub fn new(inner: Arc<dyn Embeddings>, kv: Arc<KvStore>, ttl_secs: u64) -> Self {
        Self { inner, kv, ttl_secs }
    }

    fn cache_key(prefix: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{prefix}{}", hex::encode(hasher.finalize()))
    }

    fn get_cached(&self, key: &str) -> Option<Vec<f32>> {
        let raw = self.kv.get(key)?;
        match serde_json::from_str::<Vec<f32>>(&raw) {
            Ok(v) if v.len() == EMBEDDING_DIM => Some(v),
            _ => None,
        }
    }

    fn put_cached(&self, key: &str, embedding: &[f32]) {
        if let Ok(raw) = serde_json::to_string(embedding) {
            self.kv.setex(key, self.ttl_secs, &raw);
        }
    }
}

#[async_trait]
impl Embeddings for CachedEmbeddings {
    async fn encode_realtime(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::cache_key(KEY_EMBEDDING_QUERY, text);
        if let Some(hit) = self.get_cached(&key) {
            return Ok(hit);
        }
        let embedding = self.inner.encode_realtime(text).await?;
        self.put_cached(&key, &embedding);
        Ok(embedding)
    }

    async fn encode_deep(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::cache_key(KEY_EMBEDDING_DOC, text);
        if let Some(hit) = self.get_cached(&key) {
            return Ok(hit);
        }
        let embedding = self.inner.encode_deep(text).await?;
        self.put_cached(&key, &embedding);
        Ok(embedding)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Deterministic embedder for tests: hashes tokens into a fixed basis.
    pub struct StubEmbeddings {
        pub calls: std::sync::atomic::AtomicUsize,
    }

    impl Default for StubEmbeddings {
        fn default() -> Self {
            Self { calls: std::sync::atomic::AtomicUsize::new(0) }
        }
    }

    pub fn stub_vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let idx = u16::from_be_bytes([digest[0], digest[1]]) as usize % EMBEDDING_DIM;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    #[async_trait]
    impl Embeddings for StubEmbeddings {
        async fn encode_realtime(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(stub_vector(text))
        }

        async fn encode_deep(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(stub_vector(text))
        }
    }
}
