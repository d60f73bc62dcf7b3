//! Passage store: searchable, attributable slices of uploaded documents.
//!
//! Passages are kept in an append-only vector with their embeddings inline;
//! queries run an exhaustive cosine-similarity scan, O(n) per query at
//! document-per-matter scale. There is no approximate index to drift out of
//! sync with the passages.
//!
//! Concurrency follows single-writer multiple-reader discipline: `query`
//! takes a read lock, `ingest` and `remove` take the write lock, so an
//! in-flight query never observes partially deleted vector rows.

use crate::chunk::{split_windows, DEFAULT_OVERLAP_WORDS, DEFAULT_WINDOW_WORDS};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// A contiguous slice of a source document's extracted text, plus its
/// embedding. The unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub passage_id: String,
    pub document_id: String,
    pub document_title: String,
    pub text: String,
    pub page: Option<u32>,
    /// Sequence index within the source document.
    pub ordinal: usize,
    pub embedding: Vec<f32>,
}

/// One query hit: a passage plus its cosine similarity to the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityHit {
    pub passage_id: String,
    pub document_id: String,
    pub document_title: String,
    pub text: String,
    pub page: Option<u32>,
    pub ordinal: usize,
    pub similarity: f32,
}

/// Store-level counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub total_passages: usize,
    pub total_documents: usize,
    pub embedding_dim: usize,
}

/// Retrieval capability consumed by the workflow phases.
pub trait Retriever: Send + Sync {
    fn search(&self, query: &str, top_k: usize) -> Result<Vec<SimilarityHit>>;
}

#[derive(Default, Serialize, Deserialize)]
struct StoreState {
    passages: Vec<Passage>,
    embedding_dim: usize,
}

/// Passage store with atomic JSON persistence under a storage root.
pub struct PassageStore {
    root: PathBuf,
    embedder: Box<dyn Embedder>,
    state: RwLock<StoreState>,
    window_words: usize,
    overlap_words: usize,
}

impl PassageStore {
    /// Open (or initialize) a store under `root` with default chunking.
    pub fn open(root: impl Into<PathBuf>, embedder: Box<dyn Embedder>) -> Result<Self> {
        Self::open_with_window(root, embedder, DEFAULT_WINDOW_WORDS, DEFAULT_OVERLAP_WORDS)
    }

    /// Open with explicit window/overlap sizes (word counts).
    pub fn open_with_window(
        root: impl Into<PathBuf>,
        embedder: Box<dyn Embedder>,
        window_words: usize,
        overlap_words: usize,
    ) -> Result<Self> {
        if window_words == 0 || overlap_words >= window_words {
            return Err(Error::Validation(format!(
                "window must be positive and overlap smaller than window (got {window_words}/{overlap_words})"
            )));
        }
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::io("create", &root, e))?;
        let state = load_state(&root)?;
        Ok(Self {
            root,
            embedder,
            state: RwLock::new(state),
            window_words,
            overlap_words,
        })
    }

    fn passages_path(&self) -> PathBuf {
        self.root.join("passages.json")
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    /// Split a document into passages, embed them in one batch, and append
    /// them to the store. The whole ingest is rejected if the embedding
    /// capability is unreachable; nothing is persisted on failure.
    pub fn ingest(&self, document_id: &str, title: &str, text: &str) -> Result<usize> {
        let windows = split_windows(text, self.window_words, self.overlap_words);
        if windows.is_empty() {
            return Ok(0);
        }

        // Embed before taking the write lock; a slow capability must not
        // block readers.
        let texts: Vec<String> = windows.iter().map(|w| w.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts)?;
        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
            return Err(Error::ExternalCapability(
                "embedding capability returned vectors of inconsistent dimension".to_string(),
            ));
        }

        let mut state = self.state.write().expect("store lock poisoned");
        if state.embedding_dim != 0 && state.embedding_dim != dim {
            return Err(Error::ExternalCapability(format!(
                "embedding dimension changed: store has {}, capability returned {dim}",
                state.embedding_dim
            )));
        }
        let base_ordinal = state
            .passages
            .iter()
            .filter(|p| p.document_id == document_id)
            .count();
        let count = windows.len();
        for (offset, (window, embedding)) in windows.into_iter().zip(vectors).enumerate() {
            let ordinal = base_ordinal + offset;
            state.passages.push(Passage {
                passage_id: format!("{document_id}_passage_{ordinal}"),
                document_id: document_id.to_string(),
                document_title: title.to_string(),
                text: window.text,
                page: window.page,
                ordinal,
                embedding,
            });
        }
        state.embedding_dim = dim;
        self.persist(&state)?;
        tracing::info!(document_id, passages = count, "document ingested");
        Ok(count)
    }

    /// Top-k nearest passages by cosine similarity, ties broken by insertion
    /// order. Empty store returns an empty list; `top_k` is clamped to the
    /// store size and must be at least 1.
    pub fn query(&self, text: &str, top_k: usize) -> Result<Vec<SimilarityHit>> {
        if top_k == 0 {
            return Err(Error::Validation("top_k must be at least 1".to_string()));
        }
        // Embed before taking the read lock; a slow capability must not
        // block writers. Emptiness is re-checked under the lock.
        {
            let state = self.state.read().expect("store lock poisoned");
            if state.passages.is_empty() {
                return Ok(Vec::new());
            }
        }
        let query_vec = self.embedder.embed(text)?;
        let state = self.state.read().expect("store lock poisoned");
        if state.passages.is_empty() {
            return Ok(Vec::new());
        }
        if query_vec.len() != state.embedding_dim {
            return Err(Error::ExternalCapability(format!(
                "query embedding dimension {} does not match store dimension {}",
                query_vec.len(),
                state.embedding_dim
            )));
        }

        let mut scored: Vec<(usize, f32)> = state
            .passages
            .iter()
            .enumerate()
            .map(|(i, p)| (i, cosine_similarity(&query_vec, &p.embedding)))
            .collect();
        // Stable sort keeps insertion order for equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k.min(state.passages.len()));

        Ok(scored
            .into_iter()
            .map(|(i, similarity)| {
                let p = &state.passages[i];
                SimilarityHit {
                    passage_id: p.passage_id.clone(),
                    document_id: p.document_id.clone(),
                    document_title: p.document_title.clone(),
                    text: p.text.clone(),
                    page: p.page,
                    ordinal: p.ordinal,
                    similarity,
                }
            })
            .collect())
    }

    /// Remove every passage belonging to `document_id`. Returns the removed
    /// count; unknown documents are a no-op returning 0.
    pub fn remove(&self, document_id: &str) -> Result<usize> {
        let mut state = self.state.write().expect("store lock poisoned");
        let before = state.passages.len();
        state.passages.retain(|p| p.document_id != document_id);
        let removed = before - state.passages.len();
        if removed == 0 {
            return Ok(0);
        }
        if state.passages.is_empty() {
            state.embedding_dim = 0;
        }
        self.persist(&state)?;
        tracing::info!(document_id, removed, "document removed");
        Ok(removed)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read().expect("store lock poisoned");
        let documents: BTreeSet<&str> = state
            .passages
            .iter()
            .map(|p| p.document_id.as_str())
            .collect();
        StoreStats {
            total_passages: state.passages.len(),
            total_documents: documents.len(),
            embedding_dim: state.embedding_dim,
        }
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        write_json_atomic(&self.passages_path(), state)?;
        let documents: BTreeSet<&str> = state
            .passages
            .iter()
            .map(|p| p.document_id.as_str())
            .collect();
        let stats = StoreStats {
            total_passages: state.passages.len(),
            total_documents: documents.len(),
            embedding_dim: state.embedding_dim,
        };
        write_json_atomic(&self.meta_path(), &stats)
    }
}

impl Retriever for PassageStore {
    fn search(&self, query: &str, top_k: usize) -> Result<Vec<SimilarityHit>> {
        self.query(query, top_k)
    }
}

fn load_state(root: &Path) -> Result<StoreState> {
    let path = root.join("passages.json");
    if !path.is_file() {
        return Ok(StoreState::default());
    }
    let bytes = std::fs::read(&path).map_err(|e| Error::io("read", &path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::json(format!("parse {}", path.display()), e))
}

/// Write JSON next to the target and rename into place, so a crash mid-write
/// never leaves a torn file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("{} has no parent", path.display())))?;
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::json(format!("serialize {}", path.display()), e))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io("stage", path, e))?;
    tmp.write_all(&bytes)
        .map_err(|e| Error::io("stage", path, e))?;
    tmp.persist(path)
        .map_err(|e| Error::io("publish", path, e.error))?;
    Ok(())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Deterministic embedder for tests: identical text always maps to the
    /// same unit vector, so self-similarity is 1.0.
    pub struct HashEmbedder {
        pub dim: usize,
    }

    impl HashEmbedder {
        fn vector_for(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dim];
            for (i, word) in text.split_whitespace().enumerate() {
                let mut h: u64 = 1469598103934665603;
                for b in word.bytes() {
                    h ^= b as u64;
                    h = h.wrapping_mul(1099511628211);
                }
                v[(h as usize ^ i) % self.dim] += 1.0;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in &mut v {
                    *x /= norm;
                }
            }
            v
        }
    }

    impl Embedder for HashEmbedder {
        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| self.vector_for(t)).collect())
        }
    }

    /// Embedder that always fails, for exercising `EmbeddingUnavailable`.
    pub struct DownEmbedder;

    impl Embedder for DownEmbedder {
        fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::EmbeddingUnavailable("connection refused".to_string()))
        }
    }
}
