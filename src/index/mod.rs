//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the pipeline's only persistence seam. Two
//! backends ship:
//!
//! | Backend | Module | Notes |
//! |---------|--------|-------|
//! | `sqlite` | [`sqlite`] | persistent; vectors as little-endian `f32` BLOBs |
//! | `memory` | [`memory`] | process-local; used by tests and `--backend memory` |
//!
//! Both do brute-force cosine similarity over every stored vector.
//!
//! Upserts are per document and atomic: a document's previous chunks and
//! vectors are replaced in one transaction (or one write-locked swap), so
//! a reader never sees a mix of old and new chunks.

pub mod memory;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::models::{Chunk, Document, EmbeddingRecord, IndexStats, RetrievedCandidate};

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

/// Abstract vector index backend.
///
/// Implementations must be `Send + Sync`; the pipeline shares one handle
/// across concurrent requests.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Configured index name (reported by `stats`).
    fn name(&self) -> &str;

    /// Backend identifier, e.g. `"sqlite"`.
    fn backend(&self) -> &'static str;

    /// Replace everything stored for `doc` with `records`.
    async fn upsert(&self, doc: &Document, records: &[EmbeddingRecord]) -> Result<()>;

    /// Return up to `top_k` chunks by descending cosine similarity.
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<RetrievedCandidate>>;

    /// Number of stored vectors.
    async fn count(&self) -> Result<usize>;

    /// Number of stored documents.
    async fn document_count(&self) -> Result<usize>;

    /// Stored chunks in document/position order, for inspection.
    async fn list_chunks(&self, limit: usize) -> Result<Vec<Chunk>>;

    /// Remove every document, chunk and vector.
    async fn clear(&self) -> Result<()>;

    /// Summary of what the index holds.
    async fn stats(&self) -> Result<IndexStats>;
}

/// Open the backend named in `[index] backend`.
pub async fn create_index(config: &Config) -> Result<Box<dyn VectorIndex>> {
    match config.index.backend.as_str() {
        "memory" => Ok(Box::new(MemoryIndex::new(&config.index.name))),
        "sqlite" => Ok(Box::new(SqliteIndex::open(&config.index).await?)),
        other => bail!("Unknown index backend: '{}'", other),
    }
}

/// Sort candidates by descending similarity and keep the first `top_k`.
///
/// The sort is stable, so equal similarities keep storage order.
pub(crate) fn rank(mut candidates: Vec<RetrievedCandidate>, top_k: usize) -> Vec<RetrievedCandidate> {
    candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    candidates.truncate(top_k);
    candidates
}
