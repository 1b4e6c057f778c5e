//! Core data models used throughout Answer Harness.
//!
//! These types represent the documents, chunks, candidates and answers that
//! flow through the ingestion and query pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Stage, Warning};

/// A source document as accepted by the ingestion flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub source: String,
    pub text: String,
    pub ingested_at: DateTime<Utc>,
}

/// A positioned passage of a document; the unit of retrieval.
///
/// `start`/`end` are character offsets (Unicode scalar values) into the
/// parent document, and `text` is exactly the parent's text over that span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub position: usize,
    pub start: usize,
    pub end: usize,
    pub token_count: usize,
    pub title: String,
    pub source: String,
    pub text: String,
    pub hash: String,
}

/// A chunk together with its embedding vector, as written to the index.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A chunk returned by a similarity search.
#[derive(Debug, Clone)]
pub struct RetrievedCandidate {
    pub chunk: Chunk,
    /// Provider-defined similarity; only meaningful as an ordering key.
    pub similarity: f64,
}

/// A candidate after reranking and truncation.
#[derive(Debug, Clone, Serialize)]
pub struct RerankedCandidate {
    /// 1-based citation number, assigned by final rank order.
    pub citation_number: usize,
    /// Relevance in `[0, 1]`.
    pub relevance: f64,
    pub similarity: f64,
    pub chunk: Chunk,
}

/// A passage actually cited by an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub number: usize,
    pub title: String,
    pub source: String,
    pub relevance_score: f64,
    pub text: String,
    pub document_id: String,
    pub chunk_id: String,
    pub position: usize,
}

/// Token counts reported by the generation provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Start/end record for one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: f64,
}

/// Per-stage durations of one query, in milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timings {
    pub embedding_time_ms: f64,
    pub retrieval_time_ms: f64,
    pub rerank_time_ms: f64,
    pub generation_time_ms: f64,
    pub mapping_time_ms: f64,
    pub total_time_ms: f64,
    pub stages: Vec<StageTiming>,
}

/// The structured answer to one question.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub answer: String,
    pub citations: Vec<Citation>,
    /// Every passage that was supplied to the generator, in citation order.
    pub sources: Vec<RerankedCandidate>,
    #[serde(flatten)]
    pub timings: Timings,
    pub token_usage: TokenUsage,
    pub cost_estimate: f64,
    pub rerank_degraded: bool,
    pub warnings: Vec<Warning>,
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_created: usize,
    pub processing_time_ms: f64,
}

/// Summary of what the vector index currently holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub index_name: String,
    pub backend: String,
    pub total_vectors: usize,
    pub total_documents: usize,
    pub dimensions: Option<usize>,
}

/// Round a duration or cost to a fixed number of decimals for reporting.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
