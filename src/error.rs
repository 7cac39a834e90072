//! Error types for the resolution pipeline.
//!
//! Each retrieval stage has its own error enum. The pipeline never lets these
//! escape [`crate::pipeline::Resolver::resolve`]: a failing stage is logged and
//! treated as "this stage found nothing". Only [`SyncError`] reaches a caller,
//! and only the caller of [`crate::sync::Synchronizer::rebuild`].
//!
//! | Error | Raised by | Pipeline reaction |
//! |-------|-----------|-------------------|
//! | [`EmbeddingError`] | embedding service | skip the vector stage |
//! | [`IndexUnavailableError`] | knowledge index | no vector candidates |
//! | [`GenerativeServiceError`] | generative fallback | fall through to NoAnswer |
//! | [`SourceError`] | knowledge source | wrapped into [`SyncError`] |
//! | [`SyncError`] | synchronizer | previous index stays authoritative |

use thiserror::Error;

use crate::index::Category;

/// Failures of the embedding model or its cache.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// No embedder is registered under this model id.
    #[error("no embedder registered for model {model_id}")]
    UnknownModel { model_id: String },

    /// The model itself failed (tokenization, inference, weight loading).
    #[error("embedding model {model_id} failed: {message}")]
    Model { model_id: String, message: String },

    /// The model produced a vector of the wrong length.
    #[error("embedding model {model_id} returned dimension {actual}, expected {expected}")]
    InvalidDimension {
        model_id: String,
        expected: usize,
        actual: usize,
    },

    /// Empty text cannot be embedded.
    #[error("empty input not allowed")]
    EmptyInput,

    /// The blocking worker running the model panicked or was cancelled.
    #[error("embedding worker failed: {0}")]
    Worker(String),
}

/// A collection cannot serve a vector query.
#[derive(Debug, Error, PartialEq)]
pub enum IndexUnavailableError {
    #[error("{category} collection has no entries")]
    Empty { category: Category },

    #[error("{category} collection expects dimension {expected}, got {actual}")]
    DimensionMismatch {
        category: Category,
        expected: usize,
        actual: usize,
    },
}

/// Failures of the hosted generation service, including answers we refuse to accept.
#[derive(Debug, Error, PartialEq)]
pub enum GenerativeServiceError {
    #[error("generative call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("generative transport failed: {0}")]
    Transport(String),

    #[error("generative service returned an empty response")]
    Empty,

    #[error("generative service abstained")]
    Abstained,

    #[error("generative response too short: {len} chars, need more than {min}")]
    TooShort { len: usize, min: usize },

    #[error("no generative service configured")]
    Unavailable,
}

impl GenerativeServiceError {
    /// Transport failures are worth another attempt; refusals and timeouts are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerativeServiceError::Transport(_))
    }

    /// Whether this counts as an operational error rather than a deliberate "no".
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            GenerativeServiceError::Timeout { .. } | GenerativeServiceError::Transport(_)
        )
    }
}

/// Failures fetching raw pairs from the knowledge source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("knowledge source request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("knowledge source answered HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("knowledge source returned malformed data: {0}")]
    Malformed(String),

    #[error("knowledge source has no category named {0}")]
    UnknownCategory(String),
}

impl SourceError {
    /// Network errors and 5xx/429 answers may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(_) => true,
            SourceError::Status { status, .. } => *status >= 500 || *status == 429,
            SourceError::Malformed(_) | SourceError::UnknownCategory(_) => false,
        }
    }
}

/// A rebuild was abandoned. The previously served index is untouched.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a rebuild is already in progress")]
    InProgress,

    #[error("fetching {category} failed: {source}")]
    Source {
        category: Category,
        #[source]
        source: SourceError,
    },

    #[error("embedding {category} failed: {source}")]
    Embedding {
        category: Category,
        #[source]
        source: EmbeddingError,
    },

    #[error("building {category} collection failed: {source}")]
    Index {
        category: Category,
        #[source]
        source: IndexUnavailableError,
    },
}
