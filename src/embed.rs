//! Embedding capability: fixed-length vectors for passages and queries.
//!
//! The store only assumes an opaque capability that maps text to a
//! fixed-dimension vector, deterministically enough that identical text
//! embeds to the same vector. The default implementation speaks a minimal
//! JSON protocol to a local embedding server (any sentence-transformer
//! sidecar works): POST `{"input": [..texts..]}`, receive
//! `{"embeddings": [[..f32..], ..]}`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Environment variable naming the embedding endpoint.
pub const EMBED_URL_ENV: &str = "LEXMEMO_EMBED_URL";
/// Default endpoint for a local embedding sidecar.
pub const DEFAULT_EMBED_URL: &str = "http://127.0.0.1:8377/embed";

/// External embedding capability.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; one vector per input, in order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()])?;
        vectors
            .pop()
            .ok_or_else(|| Error::ExternalCapability("embedding response was empty".to_string()))
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP client for the embedding endpoint.
pub struct HttpEmbedder {
    url: String,
}

impl HttpEmbedder {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Resolve the endpoint from the environment, falling back to the default.
    pub fn from_env() -> Self {
        let url = std::env::var(EMBED_URL_ENV).unwrap_or_else(|_| DEFAULT_EMBED_URL.to_string());
        Self::new(url)
    }
}

impl Embedder for HttpEmbedder {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let started = std::time::Instant::now();
        let mut response = ureq::post(&self.url)
            .send_json(EmbedRequest { input: texts })
            .map_err(|err| Error::EmbeddingUnavailable(format!("{}: {err}", self.url)))?;
        let parsed: EmbedResponse = response
            .body_mut()
            .read_json()
            .map_err(|err| Error::ExternalCapability(format!("decode embedding response: {err}")))?;
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            batch = texts.len(),
            "embedding batch complete"
        );
        if parsed.embeddings.len() != texts.len() {
            return Err(Error::ExternalCapability(format!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}
