//! Error kinds shared across the passage store, engine, and executor.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown run, definition, or document id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied inputs rejected before any phase executed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A phase's retrieval query returned nothing usable.
    #[error("not supported by provided documents: {0}")]
    RetrievalEmpty(String),

    /// The embedding capability was unreachable; the whole ingest is rejected.
    #[error("embedding capability unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The embedding or generation capability failed or returned unusable output.
    #[error("external capability error: {0}")]
    ExternalCapability(String),

    /// The verification gate failed. Carries the per-check outcomes and the
    /// correction plan so the executor can record them on the failed run.
    #[error("verification gate failed: {summary}")]
    GateFailure {
        summary: String,
        outcomes: Vec<crate::model::VerificationOutcome>,
        correction_plan: Vec<crate::model::CorrectionItem>,
        logs: Vec<String>,
    },

    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json {
            context: context.into(),
            source,
        }
    }
}
