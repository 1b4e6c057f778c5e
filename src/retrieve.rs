//! Similarity retrieval: embed the question once, then search the index.

use crate::embedding::{self, EmbeddingProvider};
use crate::error::{RagError, RetrievalError, Stage};
use crate::index::VectorIndex;
use crate::models::RetrievedCandidate;

/// Embed a query with exactly one gateway call.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    query: &str,
) -> Result<Vec<f32>, RagError> {
    embedding::embed_query(provider, query).await.map_err(|e| {
        tracing::warn!(code = e.code(), "query embedding failed");
        RetrievalError::Backend {
            stage: Stage::Embedding,
            code: e.code().to_string(),
        }
        .into()
    })
}

/// Search the index for the `top_k` nearest chunks.
///
/// Fails with [`RetrievalError::EmptyIndex`] when nothing is stored. The
/// record count is read once and never retried.
pub async fn search(
    index: &dyn VectorIndex,
    query_vec: &[f32],
    top_k: usize,
) -> Result<Vec<RetrievedCandidate>, RagError> {
    let count = index.count().await.map_err(|e| backend_error(&e))?;
    if count == 0 {
        return Err(RetrievalError::EmptyIndex.into());
    }

    index
        .search(query_vec, top_k)
        .await
        .map_err(|e| backend_error(&e))
}

/// Embed `query` and return up to `top_k` candidates, descending similarity.
pub async fn retrieve(
    provider: &dyn EmbeddingProvider,
    index: &dyn VectorIndex,
    query: &str,
    top_k: usize,
) -> Result<Vec<RetrievedCandidate>, RagError> {
    let query_vec = embed_query(provider, query).await?;
    search(index, &query_vec, top_k).await
}

fn backend_error(err: &anyhow::Error) -> RagError {
    tracing::warn!(error = %err, "vector index unavailable");
    RetrievalError::Backend {
        stage: Stage::Retrieving,
        code: "index_unavailable".to_string(),
    }
    .into()
}
