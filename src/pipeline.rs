//! Pipeline orchestrator.
//!
//! [`Pipeline`] owns the vector index and the three provider handles and
//! runs the two flows:
//!
//! ```text
//! ingest:  validate → chunk → embed (batched) → upsert
//! query:   Received → Embedding → Retrieving → Reranking → Generating
//!          → Mapping → Completed | Failed
//! ```
//!
//! Every query stage is timed; a failing stage short-circuits with an
//! error tagged with that stage.
//!
//! # Clearing
//!
//! A single `tokio::sync::RwLock<()>` gate serializes [`Pipeline::clear`]
//! against requests. Queries and ingests hold a read guard; clear takes
//! the write guard once in-flight requests have drained. A query that
//! cannot get a read guard immediately fails with
//! [`RagError::ClearInProgress`]; an ingest waits and lands after the clear.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::Instrument;
use uuid::Uuid;

use crate::chunk::{chunk_document, estimate_tokens};
use crate::citation::map_citations;
use crate::config::Config;
use crate::cost::{estimate_cost, Billed};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{ProviderError, RagError, Stage, Warning};
use crate::generate::{self, GenerationProvider, RetryPolicy};
use crate::index::{self, VectorIndex};
use crate::models::{
    round_to, Chunk, Document, EmbeddingRecord, IndexStats, IngestReport, QueryResult,
    StageTiming, Timings, TokenUsage,
};
use crate::prompt::{build_prompt, NO_RELEVANT_INFORMATION};
use crate::rerank::{self, RerankProvider};
use crate::retrieve;

/// File extensions accepted by [`Pipeline::ingest_file`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "csv"];

pub struct Pipeline {
    config: Config,
    embedder: Box<dyn EmbeddingProvider>,
    reranker: Box<dyn RerankProvider>,
    generator: Box<dyn GenerationProvider>,
    index: Box<dyn VectorIndex>,
    gate: RwLock<()>,
}

impl Pipeline {
    /// Assemble a pipeline from explicit collaborators.
    pub fn new(
        config: Config,
        embedder: Box<dyn EmbeddingProvider>,
        reranker: Box<dyn RerankProvider>,
        generator: Box<dyn GenerationProvider>,
        index: Box<dyn VectorIndex>,
    ) -> Self {
        Self {
            config,
            embedder,
            reranker,
            generator,
            index,
            gate: RwLock::new(()),
        }
    }

    /// Build every collaborator from configuration.
    ///
    /// A provider that cannot be constructed (for example a missing API
    /// key) is replaced by one that reports the same diagnostic code on
    /// use, so commands that do not need it still work.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder: Box<dyn EmbeddingProvider> =
            match embedding::create_provider(&config.embedding) {
                Ok(p) => p,
                Err(e) => Box::new(unavailable("embedding", e)),
            };
        let reranker: Box<dyn RerankProvider> = match rerank::create_reranker(&config.rerank) {
            Ok(p) => p,
            Err(e) => Box::new(unavailable("rerank", e)),
        };
        let generator: Box<dyn GenerationProvider> =
            match generate::create_generator(&config.generation) {
                Ok(p) => p,
                Err(e) => Box::new(unavailable("generation", e)),
            };
        let index = index::create_index(&config).await?;

        Ok(Self::new(config, embedder, reranker, generator, index))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ============ Ingestion ============

    /// Chunk, embed and store one document.
    ///
    /// The document id is derived from `source` and a hash of `text`.
    /// Re-ingesting identical text under the same source replaces the
    /// earlier copy; different text under the same source is stored as a
    /// separate document.
    pub async fn ingest_text(
        &self,
        text: &str,
        title: Option<&str>,
        source: Option<&str>,
    ) -> Result<IngestReport, RagError> {
        if text.trim().is_empty() {
            return Err(RagError::validation("text must not be empty"));
        }

        let _guard = self.gate.read().await;
        let started = Instant::now();

        let hash = content_hash(text);
        let source = match source.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.to_string(),
            None => format!("text:{}", &hash[..16]),
        };
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("Untitled")
            .to_string();

        let doc = Document {
            id: document_id(&source, &hash),
            title,
            source,
            text: text.to_string(),
            ingested_at: Utc::now(),
        };

        let span = tracing::info_span!("ingest", document_id = %doc.id, source = %doc.source);
        async {
            let chunks = chunk_document(
                &doc,
                self.config.chunking.max_tokens,
                self.config.chunking.overlap_tokens,
            );
            if chunks.is_empty() {
                return Err(RagError::validation("text must not be empty"));
            }
            tracing::debug!(chunks = chunks.len(), "chunked document");

            let records = self.embed_chunks(chunks).await?;

            self.index.upsert(&doc, &records).await.map_err(|e| {
                tracing::warn!(error = %e, "index upsert failed");
                RagError::backend(Stage::Storing, "index_write")
            })?;

            let report = IngestReport {
                document_id: doc.id.clone(),
                chunks_created: records.len(),
                processing_time_ms: round_to(started.elapsed().as_secs_f64() * 1000.0, 2),
            };
            tracing::info!(
                chunks = report.chunks_created,
                ms = report.processing_time_ms,
                "ingested document"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Ingest an uploaded file.
    ///
    /// Only plain-text formats are accepted and the content must be UTF-8.
    /// The title defaults to the file name.
    pub async fn ingest_file(
        &self,
        filename: &str,
        bytes: &[u8],
        title: Option<&str>,
    ) -> Result<IngestReport, RagError> {
        check_extension(filename)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| RagError::validation("file is not valid UTF-8 text"))?;
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(filename);
        self.ingest_text(text, Some(title), Some(filename)).await
    }

    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddingRecord>, RagError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedding::embed_batched(
            self.embedder.as_ref(),
            &texts,
            self.config.embedding.batch_size,
        )
        .await
        .map_err(|e| {
            tracing::warn!(code = e.code(), "chunk embedding failed");
            RagError::backend(Stage::Embedding, e.code())
        })?;

        let dims = self.embedder.dims();
        if dims > 0 && vectors.iter().any(|v| v.len() != dims) {
            tracing::warn!(expected = dims, "embedding dimensionality mismatch");
            return Err(RagError::backend(Stage::Embedding, "dimension_mismatch"));
        }

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddingRecord { chunk, vector })
            .collect())
    }

    // ============ Query ============

    /// Answer `question` from the indexed documents.
    ///
    /// `top_k` and `rerank_top_k` default to the `[retrieval]` settings.
    pub async fn query(
        &self,
        question: &str,
        top_k: Option<usize>,
        rerank_top_k: Option<usize>,
    ) -> Result<QueryResult, RagError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::validation("query must not be empty"));
        }
        let top_k = top_k.unwrap_or(self.config.retrieval.top_k);
        let rerank_top_k = rerank_top_k.unwrap_or(self.config.retrieval.rerank_top_k);
        if top_k == 0 {
            return Err(RagError::validation("top_k must be at least 1"));
        }
        if rerank_top_k == 0 {
            return Err(RagError::validation("rerank_top_k must be at least 1"));
        }

        let _guard = self
            .gate
            .try_read()
            .map_err(|_| RagError::ClearInProgress)?;

        let span = tracing::info_span!(
            "query",
            question_len = question.chars().count(),
            top_k,
            rerank_top_k
        );
        self.run_query(question, top_k, rerank_top_k)
            .instrument(span)
            .await
    }

    async fn run_query(
        &self,
        question: &str,
        top_k: usize,
        rerank_top_k: usize,
    ) -> Result<QueryResult, RagError> {
        let mut trace = QueryTrace::new();
        let mut warnings = Vec::new();

        trace.enter(Stage::Embedding);
        let query_vec = match retrieve::embed_query(self.embedder.as_ref(), question).await {
            Ok(v) => v,
            Err(e) => return Err(trace.fail(e)),
        };

        trace.enter(Stage::Retrieving);
        let candidates = match retrieve::search(self.index.as_ref(), &query_vec, top_k).await {
            Ok(c) => c,
            Err(e) => return Err(trace.fail(e)),
        };
        tracing::debug!(candidates = candidates.len(), "retrieved candidates");

        trace.enter(Stage::Reranking);
        let outcome =
            rerank::rerank(self.reranker.as_ref(), question, candidates, rerank_top_k).await;
        if let Some(code) = &outcome.degraded {
            warnings.push(Warning::RerankDegraded { code: code.clone() });
        }

        trace.enter(Stage::Generating);
        let (raw_answer, usage) = if outcome.candidates.is_empty() {
            (NO_RELEVANT_INFORMATION.to_string(), TokenUsage::default())
        } else {
            let prompt = build_prompt(question, &outcome.candidates);
            let policy = RetryPolicy::from_config(&self.config.generation);
            match generate::generate_answer(self.generator.as_ref(), &prompt, policy).await {
                Ok(g) => (g.text, g.usage),
                Err(e) => return Err(trace.fail(e)),
            }
        };

        trace.enter(Stage::Mapping);
        let mapped = map_citations(&raw_answer, &outcome.candidates);
        if !mapped.invalid_markers.is_empty() {
            warnings.push(Warning::CitationIntegrity {
                markers: mapped.invalid_markers.clone(),
            });
        }

        let billed = Billed {
            embedding: self.embedder.billable(),
            rerank: outcome.provider_ran && self.reranker.billable(),
            generation: self.generator.billable(),
        };
        let cost_estimate =
            estimate_cost(&self.config.pricing, estimate_tokens(question), billed, &usage);
        let timings = trace.complete();

        tracing::info!(
            citations = mapped.citations.len(),
            total_ms = timings.total_time_ms,
            degraded = outcome.degraded.is_some(),
            "query complete"
        );

        Ok(QueryResult {
            answer: mapped.answer,
            citations: mapped.citations,
            sources: outcome.candidates,
            timings,
            token_usage: usage,
            cost_estimate,
            rerank_degraded: outcome.degraded.is_some(),
            warnings,
        })
    }

    // ============ Maintenance ============

    /// Remove everything from the index once in-flight requests finish.
    pub async fn clear(&self) -> Result<(), RagError> {
        let _guard = self.gate.write().await;
        self.index.clear().await.map_err(|e| {
            tracing::warn!(error = %e, "index clear failed");
            RagError::backend(Stage::Clearing, "index_clear")
        })?;
        tracing::info!(index = self.index.name(), "cleared knowledge base");
        Ok(())
    }

    pub async fn stats(&self) -> anyhow::Result<IndexStats> {
        let mut stats = self.index.stats().await?;
        if stats.dimensions.is_none() && self.embedder.dims() > 0 {
            stats.dimensions = Some(self.embedder.dims());
        }
        Ok(stats)
    }

    pub async fn list_chunks(&self, limit: usize) -> anyhow::Result<Vec<Chunk>> {
        self.index.list_chunks(limit).await
    }
}

/// Reject file names whose extension is not a supported text format.
pub fn check_extension(filename: &str) -> Result<(), RagError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        Some(ext) => Err(RagError::UnsupportedFormat(format!(".{}", ext))),
        None => Err(RagError::UnsupportedFormat(filename.to_string())),
    }
}

fn document_id(source: &str, content_hash: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{}#{}", source, content_hash).as_bytes(),
    )
    .to_string()
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============ Query state machine ============

struct QueryTrace {
    stage: Stage,
    started: Instant,
    stage_started: Instant,
    stage_started_at: DateTime<Utc>,
    stages: Vec<StageTiming>,
}

impl QueryTrace {
    fn new() -> Self {
        let now = Instant::now();
        tracing::debug!(stage = %Stage::Received, "query state");
        Self {
            stage: Stage::Received,
            started: now,
            stage_started: now,
            stage_started_at: Utc::now(),
            stages: Vec::new(),
        }
    }

    fn close_stage(&mut self) {
        if self.stage == Stage::Received {
            return;
        }
        self.stages.push(StageTiming {
            stage: self.stage,
            started_at: self.stage_started_at,
            ended_at: Utc::now(),
            duration_ms: round_to(self.stage_started.elapsed().as_secs_f64() * 1000.0, 2),
        });
    }

    fn enter(&mut self, stage: Stage) {
        self.close_stage();
        self.stage = stage;
        self.stage_started = Instant::now();
        self.stage_started_at = Utc::now();
        tracing::debug!(stage = %stage, "query state");
    }

    fn fail(&mut self, err: RagError) -> RagError {
        let failed_in = self.stage;
        self.close_stage();
        self.stage = Stage::Failed;
        tracing::debug!(stage = %Stage::Failed, failed_in = %failed_in, code = err.code(), "query state");
        err
    }

    fn duration(&self, stage: Stage) -> f64 {
        self.stages
            .iter()
            .filter(|s| s.stage == stage)
            .map(|s| s.duration_ms)
            .sum()
    }

    fn complete(mut self) -> Timings {
        self.close_stage();
        self.stage = Stage::Completed;
        tracing::debug!(stage = %Stage::Completed, "query state");
        Timings {
            embedding_time_ms: self.duration(Stage::Embedding),
            retrieval_time_ms: self.duration(Stage::Retrieving),
            rerank_time_ms: self.duration(Stage::Reranking),
            generation_time_ms: self.duration(Stage::Generating),
            mapping_time_ms: self.duration(Stage::Mapping),
            total_time_ms: round_to(self.started.elapsed().as_secs_f64() * 1000.0, 2),
            stages: self.stages,
        }
    }
}

// ============ Unavailable collaborator ============

/// Stand-in for a provider that could not be constructed.
struct Unavailable {
    code: String,
}

fn unavailable(kind: &str, err: ProviderError) -> Unavailable {
    tracing::warn!(provider = kind, code = err.code(), "provider unavailable");
    Unavailable {
        code: err.code().to_string(),
    }
}

#[async_trait]
impl EmbeddingProvider for Unavailable {
    fn model_name(&self) -> &str {
        "unavailable"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::unavailable(self.code.clone()))
    }
}

#[async_trait]
impl RerankProvider for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }
    async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f64>, ProviderError> {
        Err(ProviderError::unavailable(self.code.clone()))
    }
}

#[async_trait]
impl GenerationProvider for Unavailable {
    fn model_name(&self) -> &str {
        "unavailable"
    }
    async fn complete(&self, _prompt: &crate::prompt::Prompt) -> Result<generate::Generation, ProviderError> {
        Err(ProviderError::unavailable(self.code.clone()))
    }
}
