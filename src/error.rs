//! Error and warning types for the answer pipeline.
//!
//! [`RagError`] is the user-facing taxonomy returned by ingestion and
//! query operations. Validation and format errors carry their message
//! verbatim; everything that comes from a backend or provider is reduced
//! to the failing [`Stage`] plus a short diagnostic code, so provider
//! response bodies never reach the caller (they are logged instead).
//!
//! Non-fatal outcomes (degraded reranking, bad citation markup) are
//! reported as [`Warning`] values attached to a successful result.

use serde::Serialize;
use std::fmt;

/// Pipeline stage, used both as the query state machine and to tag errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Embedding,
    Retrieving,
    Reranking,
    Generating,
    Mapping,
    Storing,
    Clearing,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Embedding => "embedding",
            Stage::Retrieving => "retrieving",
            Stage::Reranking => "reranking",
            Stage::Generating => "generating",
            Stage::Mapping => "mapping",
            Stage::Storing => "storing",
            Stage::Clearing => "clearing",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an external collaborator (embedding, rerank, generation).
///
/// The `code` is a short, stable diagnostic such as `http_503`,
/// `network`, `timeout`, `missing_api_key` or `empty_content`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Worth retrying: network failure, timeout, HTTP 429 or 5xx.
    #[error("provider request failed transiently ({code})")]
    Transient { code: String },

    /// Not worth retrying: client error, malformed or empty response.
    #[error("provider request failed ({code})")]
    Fatal { code: String },

    /// The provider is not configured or is switched off.
    #[error("provider unavailable ({code})")]
    Unavailable { code: String },
}

impl ProviderError {
    pub fn transient(code: impl Into<String>) -> Self {
        ProviderError::Transient { code: code.into() }
    }

    pub fn fatal(code: impl Into<String>) -> Self {
        ProviderError::Fatal { code: code.into() }
    }

    pub fn unavailable(code: impl Into<String>) -> Self {
        ProviderError::Unavailable { code: code.into() }
    }

    pub fn code(&self) -> &str {
        match self {
            ProviderError::Transient { code }
            | ProviderError::Fatal { code }
            | ProviderError::Unavailable { code } => code,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        let code = format!("http_{}", status.as_u16());
        if status.as_u16() == 429 || status.is_server_error() {
            ProviderError::Transient { code }
        } else {
            ProviderError::Fatal { code }
        }
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::transient("timeout")
        } else if err.is_decode() {
            ProviderError::fatal("bad_response")
        } else {
            ProviderError::transient("network")
        }
    }
}

/// Failure of the retrieval stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrievalError {
    /// Nothing has been ingested (or the knowledge base was cleared).
    #[error("the knowledge base is empty; add documents first")]
    EmptyIndex,

    /// The embedding gateway or the vector index could not be reached.
    #[error("retrieval backend unavailable during {stage} ({code})")]
    Backend { stage: Stage, code: String },
}

/// Top-level error for ingestion, query and clear operations.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Empty or malformed input. User-fixable.
    #[error("{0}")]
    Validation(String),

    /// File type outside the accepted plain-text formats.
    #[error("unsupported file format '{0}': only .txt, .md, .markdown and .csv files are accepted")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    /// Answer generation failed after the bounded retry budget.
    #[error("answer generation failed after {attempts} attempt(s) ({code})")]
    Generation { attempts: u32, code: String },

    /// A query arrived while the knowledge base was being cleared.
    #[error("the knowledge base is being cleared; retry shortly")]
    ClearInProgress,

    /// Any other backend failure, tagged with the stage it happened in.
    #[error("{stage} stage failed ({code})")]
    Backend { stage: Stage, code: String },
}

impl RagError {
    pub fn validation(message: impl Into<String>) -> Self {
        RagError::Validation(message.into())
    }

    pub fn backend(stage: Stage, code: impl Into<String>) -> Self {
        RagError::Backend {
            stage,
            code: code.into(),
        }
    }

    /// The stage this error is attributed to, when there is one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RagError::Validation(_) | RagError::UnsupportedFormat(_) => Some(Stage::Received),
            RagError::Retrieval(RetrievalError::EmptyIndex) => Some(Stage::Retrieving),
            RagError::Retrieval(RetrievalError::Backend { stage, .. }) => Some(*stage),
            RagError::Generation { .. } => Some(Stage::Generating),
            RagError::ClearInProgress => None,
            RagError::Backend { stage, .. } => Some(*stage),
        }
    }

    /// Machine-readable error code used by the HTTP layer and the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "bad_request",
            RagError::UnsupportedFormat(_) => "unsupported_format",
            RagError::Retrieval(RetrievalError::EmptyIndex) => "empty_index",
            RagError::Retrieval(RetrievalError::Backend { .. }) => "retrieval_error",
            RagError::Generation { .. } => "generation_error",
            RagError::ClearInProgress => "clear_in_progress",
            RagError::Backend { .. } => "internal",
        }
    }
}

/// Non-fatal condition attached to an otherwise successful result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The reranker was unavailable; similarity order was used instead.
    RerankDegraded { code: String },
    /// The answer contained out-of-range or malformed citation markers.
    CitationIntegrity { markers: Vec<String> },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::RerankDegraded { code } => {
                write!(f, "reranker unavailable ({}); using similarity order", code)
            }
            Warning::CitationIntegrity { markers } => {
                write!(f, "ignored invalid citation markers: {}", markers.join(", "))
            }
        }
    }
}
