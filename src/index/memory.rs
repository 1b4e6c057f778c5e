//! In-memory [`VectorIndex`] implementation.
//!
//! Documents and their records live in one map behind a `std::sync::RwLock`;
//! an upsert swaps a document's entry under a single write lock.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, Document, EmbeddingRecord, IndexStats, RetrievedCandidate};

use super::{rank, VectorIndex};

struct StoredDoc {
    records: Vec<EmbeddingRecord>,
}

/// Process-local index, keyed by document id.
pub struct MemoryIndex {
    name: String,
    docs: RwLock<BTreeMap<String, StoredDoc>>,
}

impl MemoryIndex {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            docs: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, StoredDoc>>> {
        self.docs
            .read()
            .map_err(|_| anyhow!("memory index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, StoredDoc>>> {
        self.docs
            .write()
            .map_err(|_| anyhow!("memory index lock poisoned"))
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, doc: &Document, records: &[EmbeddingRecord]) -> Result<()> {
        let mut docs = self.write()?;
        docs.insert(
            doc.id.clone(),
            StoredDoc {
                records: records.to_vec(),
            },
        );
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<RetrievedCandidate>> {
        let docs = self.read()?;
        let candidates = docs
            .values()
            .flat_map(|d| d.records.iter())
            .map(|r| RetrievedCandidate {
                chunk: r.chunk.clone(),
                similarity: cosine_similarity(query, &r.vector) as f64,
            })
            .collect();
        Ok(rank(candidates, top_k))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.values().map(|d| d.records.len()).sum())
    }

    async fn document_count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    async fn list_chunks(&self, limit: usize) -> Result<Vec<Chunk>> {
        let docs = self.read()?;
        Ok(docs
            .values()
            .flat_map(|d| d.records.iter().map(|r| r.chunk.clone()))
            .take(limit)
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let docs = self.read()?;
        let dimensions = docs
            .values()
            .flat_map(|d| d.records.first())
            .map(|r| r.vector.len())
            .next();
        Ok(IndexStats {
            index_name: self.name.clone(),
            backend: self.backend().to_string(),
            total_vectors: docs.values().map(|d| d.records.len()).sum(),
            total_documents: docs.len(),
            dimensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(id: &str) -> Document {
        Document {
            id: id.to_string(),
            title: format!("Title {}", id),
            source: format!("{}.txt", id),
            text: String::new(),
            ingested_at: Utc::now(),
        }
    }

    fn record(doc_id: &str, position: usize, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            chunk: Chunk {
                id: format!("{}-{}", doc_id, position),
                document_id: doc_id.to_string(),
                position,
                start: 0,
                end: 0,
                token_count: 1,
                title: String::new(),
                source: String::new(),
                text: format!("chunk {}", position),
                hash: String::new(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_document() {
        let index = MemoryIndex::new("test");
        let d = doc("a");
        index
            .upsert(&d, &[record("a", 0, vec![1.0, 0.0]), record("a", 1, vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 2);

        index.upsert(&d, &[record("a", 0, vec![1.0, 1.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.document_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let index = MemoryIndex::new("test");
        index
            .upsert(
                &doc("a"),
                &[
                    record("a", 0, vec![0.0, 1.0]),
                    record("a", 1, vec![1.0, 0.0]),
                    record("a", 2, vec![1.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let results = index.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.position, 1);
        assert_eq!(results[1].chunk.position, 2);
        assert!(results[0].similarity >= results[1].similarity);
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let index = MemoryIndex::new("kb");
        index
            .upsert(&doc("a"), &[record("a", 0, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.index_name, "kb");
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.dimensions, Some(3));

        index.clear().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.search(&[1.0, 0.0, 0.0], 5).await.unwrap().is_empty());
        assert_eq!(index.stats().await.unwrap().dimensions, None);
    }
}
