//! End-to-end tests of the ingest and query flows against the in-memory
//! index and the offline providers, with scripted collaborators where a
//! test needs to control model output or failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use answer_harness::chunk::estimate_tokens;
use answer_harness::citation::marker_numbers;
use answer_harness::config::Config;
use answer_harness::embedding::{DisabledProvider, EmbeddingProvider, HashEmbedder};
use answer_harness::error::{ProviderError, RagError, RetrievalError, Stage, Warning};
use answer_harness::generate::{ExtractiveProvider, Generation, GenerationProvider};
use answer_harness::index::{MemoryIndex, VectorIndex};
use answer_harness::models::{
    Chunk, Document, EmbeddingRecord, IndexStats, RetrievedCandidate, TokenUsage,
};
use answer_harness::pipeline::Pipeline;
use answer_harness::prompt::Prompt;
use answer_harness::rerank::{DisabledReranker, LexicalReranker, RerankProvider};

// ─── Test collaborators ─────────────────────────────────────────────

/// Returns the same answer text for every prompt and records the prompts.
struct ScriptedGenerator {
    answer: String,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedGenerator {
    fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Generation, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        Ok(Generation {
            text: self.answer.clone(),
            usage: TokenUsage {
                prompt_tokens: 1000,
                completion_tokens: 100,
                total_tokens: 1100,
            },
        })
    }
}

/// Fails every call with the given error and counts the attempts.
struct FailingGenerator {
    error: ProviderError,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl GenerationProvider for FailingGenerator {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _prompt: &Prompt) -> Result<Generation, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Gives every passage the same score.
struct FlatReranker;

#[async_trait]
impl RerankProvider for FlatReranker {
    fn name(&self) -> &str {
        "flat"
    }

    async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f64>, ProviderError> {
        Ok(vec![0.5; documents.len()])
    }
}

/// Wraps a [`MemoryIndex`] and counts calls per operation.
struct CountingIndex {
    inner: MemoryIndex,
    counts: Arc<AtomicUsize>,
    searches: Arc<AtomicUsize>,
}

#[async_trait]
impl VectorIndex for CountingIndex {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn backend(&self) -> &'static str {
        "counting"
    }
    async fn upsert(&self, doc: &Document, records: &[EmbeddingRecord]) -> anyhow::Result<()> {
        self.inner.upsert(doc, records).await
    }
    async fn search(&self, query: &[f32], top_k: usize) -> anyhow::Result<Vec<RetrievedCandidate>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.search(query, top_k).await
    }
    async fn count(&self) -> anyhow::Result<usize> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        self.inner.count().await
    }
    async fn document_count(&self) -> anyhow::Result<usize> {
        self.inner.document_count().await
    }
    async fn list_chunks(&self, limit: usize) -> anyhow::Result<Vec<Chunk>> {
        self.inner.list_chunks(limit).await
    }
    async fn clear(&self) -> anyhow::Result<()> {
        self.inner.clear().await
    }
    async fn stats(&self) -> anyhow::Result<IndexStats> {
        self.inner.stats().await
    }
}

/// Wraps a [`MemoryIndex`] and logs every write in order.
struct RecordingIndex {
    inner: MemoryIndex,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl VectorIndex for RecordingIndex {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn backend(&self) -> &'static str {
        "recording"
    }
    async fn upsert(&self, doc: &Document, records: &[EmbeddingRecord]) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("upsert {}", doc.source));
        self.inner.upsert(doc, records).await
    }
    async fn search(&self, query: &[f32], top_k: usize) -> anyhow::Result<Vec<RetrievedCandidate>> {
        self.inner.search(query, top_k).await
    }
    async fn count(&self) -> anyhow::Result<usize> {
        self.inner.count().await
    }
    async fn document_count(&self) -> anyhow::Result<usize> {
        self.inner.document_count().await
    }
    async fn list_chunks(&self, limit: usize) -> anyhow::Result<Vec<Chunk>> {
        self.inner.list_chunks(limit).await
    }
    async fn clear(&self) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("clear".to_string());
        self.inner.clear().await
    }
    async fn stats(&self) -> anyhow::Result<IndexStats> {
        self.inner.stats().await
    }
}

/// Hash embeddings, but any batch containing the word "slowly" stalls for
/// `delay` after signalling `started`.
struct SlowEmbedder {
    inner: HashEmbedder,
    delay: Duration,
    started: Arc<Notify>,
    calls: Arc<AtomicUsize>,
}

impl SlowEmbedder {
    fn new(delay: Duration) -> Self {
        Self {
            inner: HashEmbedder::new(64),
            delay,
            started: Arc::new(Notify::new()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_name(&self) -> &str {
        "slow-hash"
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts.iter().any(|t| t.contains("slowly")) {
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
        }
        self.inner.embed(texts).await
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.index.backend = "memory".to_string();
    config.generation.retry_base_ms = 1;
    config
}

fn offline_pipeline() -> Pipeline {
    Pipeline::new(
        test_config(),
        Box::new(HashEmbedder::new(256)),
        Box::new(LexicalReranker),
        Box::new(ExtractiveProvider),
        Box::new(MemoryIndex::new("test")),
    )
}

fn pipeline_with(
    reranker: Box<dyn RerankProvider>,
    generator: Box<dyn GenerationProvider>,
) -> Pipeline {
    Pipeline::new(
        test_config(),
        Box::new(HashEmbedder::new(256)),
        reranker,
        generator,
        Box::new(MemoryIndex::new("test")),
    )
}

async fn ingest_corpus(pipeline: &Pipeline) {
    let docs = [
        (
            "Sky",
            "sky.md",
            "The sky is blue on a clear day. Sunsets turn the sky orange and red.",
        ),
        (
            "Water",
            "water.md",
            "Water boils at 100 degrees Celsius at sea level. Ice melts at zero degrees.",
        ),
        (
            "Returns",
            "returns.md",
            "Items can be returned within 45 days for a full refund.",
        ),
        (
            "Shipping",
            "shipping.md",
            "Standard shipping takes five business days. Express shipping takes two days.",
        ),
    ];
    for (title, source, text) in docs {
        pipeline
            .ingest_text(text, Some(title), Some(source))
            .await
            .unwrap();
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_sky_is_blue_answer_cites_the_passage() {
    let pipeline = offline_pipeline();
    let text = "The sky is blue. Water boils at 100°C.";
    let report = pipeline
        .ingest_text(text, Some("Facts"), Some("facts.txt"))
        .await
        .unwrap();
    assert_eq!(report.chunks_created, 1);

    let result = pipeline
        .query("What color is the sky?", None, None)
        .await
        .unwrap();

    assert!(result.answer.contains("[1]"), "answer: {}", result.answer);
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].number, 1);
    assert_eq!(result.citations[0].text, text);
    assert_eq!(result.citations[0].title, "Facts");
    assert_eq!(result.citations[0].source, "facts.txt");
    assert!(!result.rerank_degraded);
    assert!(result.warnings.is_empty());
    assert!(result.token_usage.total_tokens > 0);
    // Hash embeddings, lexical rerank and extractive answers are free.
    assert_eq!(result.cost_estimate, 0.0);
    assert!(result.timings.total_time_ms >= result.timings.retrieval_time_ms);
}

#[tokio::test]
async fn test_three_thousand_token_document_is_chunked_with_overlap() {
    let pipeline = offline_pipeline();
    let sentence = "Rivers carry water from mountains toward the sea daily.";
    let text = vec![sentence; 300].join(" ");
    assert_eq!(estimate_tokens(&text), 3000);

    let report = pipeline
        .ingest_text(&text, Some("Rivers"), Some("rivers.txt"))
        .await
        .unwrap();
    assert!(
        (3..=4).contains(&report.chunks_created),
        "got {} chunks",
        report.chunks_created
    );

    let chunks = pipeline.list_chunks(10).await.unwrap();
    assert_eq!(chunks.len(), report.chunks_created);
    for pair in chunks.windows(2) {
        assert!(pair[1].start < pair[0].end, "adjacent chunks must overlap");
        let shared: String = text
            .chars()
            .skip(pair[1].start)
            .take(pair[0].end - pair[1].start)
            .collect();
        assert!(estimate_tokens(&shared) >= 100);
    }
    for c in &chunks {
        assert!(c.token_count <= 1000);
    }
}

#[tokio::test]
async fn test_query_against_empty_index_is_retrieval_error() {
    let counts = Arc::new(AtomicUsize::new(0));
    let searches = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::new(
        test_config(),
        Box::new(HashEmbedder::new(64)),
        Box::new(LexicalReranker),
        Box::new(ExtractiveProvider),
        Box::new(CountingIndex {
            inner: MemoryIndex::new("empty"),
            counts: counts.clone(),
            searches: searches.clone(),
        }),
    );

    let err = pipeline.query("anything?", None, None).await.unwrap_err();
    assert!(matches!(err, RagError::Retrieval(RetrievalError::EmptyIndex)));
    assert_eq!(err.stage(), Some(Stage::Retrieving));
    assert_eq!(counts.load(Ordering::SeqCst), 1);
    assert_eq!(searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_clear_then_query_is_retrieval_error() {
    let pipeline = offline_pipeline();
    ingest_corpus(&pipeline).await;
    assert!(pipeline.query("Why is the sky blue?", None, None).await.is_ok());

    pipeline.clear().await.unwrap();

    let err = pipeline
        .query("Why is the sky blue?", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "empty_index");
    assert_eq!(pipeline.stats().await.unwrap().total_vectors, 0);
}

// ─── Reranking ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_rerank_top_k_bounds_sources() {
    let pipeline = offline_pipeline();
    ingest_corpus(&pipeline).await;

    let result = pipeline
        .query("How long does shipping take?", Some(4), Some(2))
        .await
        .unwrap();
    assert!(result.sources.len() <= 2);
    let numbers: Vec<usize> = result.sources.iter().map(|s| s.citation_number).collect();
    assert_eq!(numbers, (1..=result.sources.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_equal_rerank_scores_keep_retrieval_order() {
    let pipeline = pipeline_with(
        Box::new(FlatReranker),
        Box::new(ScriptedGenerator::new("See [1].")),
    );
    ingest_corpus(&pipeline).await;

    let result = pipeline
        .query("sky water shipping refund", Some(4), Some(4))
        .await
        .unwrap();
    assert_eq!(result.sources.len(), 4);
    for pair in result.sources.windows(2) {
        assert!(
            pair[0].similarity >= pair[1].similarity,
            "equal rerank scores must preserve similarity order"
        );
    }
    assert!(!result.rerank_degraded);
}

#[tokio::test]
async fn test_disabled_reranker_degrades_to_similarity_order() {
    let pipeline = pipeline_with(Box::new(DisabledReranker), Box::new(ExtractiveProvider));
    ingest_corpus(&pipeline).await;

    let result = pipeline
        .query("What color is the sky?", Some(4), Some(3))
        .await
        .unwrap();
    assert!(result.rerank_degraded);
    assert!(result.warnings.contains(&Warning::RerankDegraded {
        code: "rerank_disabled".to_string()
    }));
    assert_eq!(result.sources.len(), 3);
    for pair in result.sources.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }
    for s in &result.sources {
        assert!((0.0..=1.0).contains(&s.relevance));
    }
}

// ─── Citations ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_markers_are_stripped_and_reported() {
    let pipeline = pipeline_with(
        Box::new(LexicalReranker),
        Box::new(ScriptedGenerator::new(
            "The sky is blue [1]. It is also blue [1][9]. See [x] and [2a].",
        )),
    );
    ingest_corpus(&pipeline).await;

    let result = pipeline
        .query("What color is the sky?", Some(4), Some(2))
        .await
        .unwrap();

    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].number, 1);
    assert!(!result.answer.contains("[9]"));
    assert!(!result.answer.contains("[2a]"));
    assert!(result.answer.contains("[x]"), "prose brackets are left alone");
    assert!(result.warnings.iter().any(|w| matches!(
        w,
        Warning::CitationIntegrity { markers } if markers.contains(&"[9]".to_string())
    )));
}

#[tokio::test]
async fn test_citation_numbers_match_markers_in_answer() {
    let answers = [
        "First [2], then [1], then [2] again.",
        "Combined [1, 2] claim and a bogus [7].",
        "No citations at all.",
        "Nested [1[7]] marker.",
    ];
    for answer in answers {
        let pipeline = pipeline_with(
            Box::new(LexicalReranker),
            Box::new(ScriptedGenerator::new(answer)),
        );
        ingest_corpus(&pipeline).await;

        let result = pipeline
            .query("sky water", Some(4), Some(2))
            .await
            .unwrap();
        let cited: Vec<usize> = result.citations.iter().map(|c| c.number).collect();
        let markers: Vec<usize> = marker_numbers(&result.answer).into_iter().collect();
        assert_eq!(cited, markers, "answer: {}", result.answer);
        assert!(cited.windows(2).all(|w| w[0] < w[1]));
        for c in &result.citations {
            assert!(c.number >= 1 && c.number <= result.sources.len());
        }
    }
}

#[tokio::test]
async fn test_prompt_numbers_passages_in_rank_order() {
    let generator = Arc::new(ScriptedGenerator::new("Blue [1]."));
    struct Shared(Arc<ScriptedGenerator>);
    #[async_trait]
    impl GenerationProvider for Shared {
        fn model_name(&self) -> &str {
            self.0.model_name()
        }
        async fn complete(&self, prompt: &Prompt) -> Result<Generation, ProviderError> {
            self.0.complete(prompt).await
        }
    }

    let pipeline = pipeline_with(Box::new(LexicalReranker), Box::new(Shared(generator.clone())));
    ingest_corpus(&pipeline).await;
    let result = pipeline
        .query("What color is the sky?", Some(4), Some(3))
        .await
        .unwrap();

    let prompts = generator.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert_eq!(prompt.passages.len(), result.sources.len());
    for (passage, source) in prompt.passages.iter().zip(&result.sources) {
        assert_eq!(passage.number, source.citation_number);
        assert_eq!(passage.text, source.chunk.text.trim());
        assert!(prompt.user.contains(&format!("[{}]:", passage.number)));
    }
    assert!(prompt.user.contains("What color is the sky?"));
}

// ─── Generation failures ────────────────────────────────────────────

#[tokio::test]
async fn test_transient_generation_failure_is_retried_then_reported() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline_with(
        Box::new(LexicalReranker),
        Box::new(FailingGenerator {
            error: ProviderError::transient("http_503"),
            calls: calls.clone(),
        }),
    );
    ingest_corpus(&pipeline).await;

    let err = pipeline
        .query("What color is the sky?", None, None)
        .await
        .unwrap_err();
    match &err {
        RagError::Generation { attempts, code } => {
            assert_eq!(*attempts, 3);
            assert_eq!(code, "http_503");
        }
        other => panic!("expected generation error, got {:?}", other),
    }
    assert_eq!(err.stage(), Some(Stage::Generating));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fatal_generation_failure_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline_with(
        Box::new(LexicalReranker),
        Box::new(FailingGenerator {
            error: ProviderError::fatal("http_401"),
            calls: calls.clone(),
        }),
    );
    ingest_corpus(&pipeline).await;

    let err = pipeline
        .query("What color is the sky?", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "generation_error");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ─── Ingestion ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_ingest_file_rejects_unsupported_formats() {
    let pipeline = offline_pipeline();
    let err = pipeline
        .ingest_file("report.pdf", b"%PDF-1.7", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::UnsupportedFormat(ref ext) if ext == ".pdf"));

    let err = pipeline
        .ingest_file("notes.txt", &[0xff, 0xfe, 0x00], None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_request");

    let report = pipeline
        .ingest_file("notes.md", b"# Notes\n\nShipping is free over fifty dollars.", None)
        .await
        .unwrap();
    assert_eq!(report.chunks_created, 1);
    let chunks = pipeline.list_chunks(10).await.unwrap();
    assert_eq!(chunks[0].title, "notes.md");
    assert_eq!(chunks[0].source, "notes.md");
}

#[tokio::test]
async fn test_unanswerable_question_gets_refusal_without_citations() {
    let pipeline = offline_pipeline();
    ingest_corpus(&pipeline).await;

    let result = pipeline
        .query("Quantum chromodynamics lattice gauge?", None, None)
        .await
        .unwrap();
    assert!(result.citations.is_empty());
    assert!(result.answer.contains("enough information"), "{}", result.answer);
}

#[tokio::test]
async fn test_concurrent_queries_do_not_interfere() {
    let pipeline = Arc::new(offline_pipeline());
    ingest_corpus(&pipeline).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let p = pipeline.clone();
        handles.push(tokio::spawn(async move {
            p.query("How many days to return items for a refund?", None, None)
                .await
                .map(|r| r.answer)
        }));
    }
    let mut answers = Vec::new();
    for h in handles {
        answers.push(h.await.unwrap().unwrap());
    }
    assert!(answers.windows(2).all(|w| w[0] == w[1]));
    assert!(answers[0].contains("45"));
}

// ─── Cost ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_only_billable_providers_are_charged() {
    // Scripted generation reports 1000 prompt and 100 completion tokens.
    let generation_only = pipeline_with(
        Box::new(LexicalReranker),
        Box::new(ScriptedGenerator::new("Blue [1].")),
    );
    ingest_corpus(&generation_only).await;
    let result = generation_only
        .query("What color is the sky?", None, None)
        .await
        .unwrap();
    assert!((result.cost_estimate - 0.00078).abs() < 1e-9, "{}", result.cost_estimate);

    let with_rerank = pipeline_with(
        Box::new(FlatReranker),
        Box::new(ScriptedGenerator::new("Blue [1].")),
    );
    ingest_corpus(&with_rerank).await;
    let result = with_rerank
        .query("What color is the sky?", None, None)
        .await
        .unwrap();
    assert!((result.cost_estimate - 0.00178).abs() < 1e-9, "{}", result.cost_estimate);
}

// ─── Document identity ──────────────────────────────────────────────

#[tokio::test]
async fn test_same_filename_uploads_keep_both_documents() {
    let pipeline = offline_pipeline();
    let first = pipeline
        .ingest_file("notes.txt", b"The sky is blue.", None)
        .await
        .unwrap();
    let second = pipeline
        .ingest_file("notes.txt", b"Water boils at 100 degrees.", None)
        .await
        .unwrap();
    assert_ne!(first.document_id, second.document_id);

    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.total_documents, 2);
    assert_eq!(stats.total_vectors, 2);

    let result = pipeline
        .query("What color is the sky?", None, None)
        .await
        .unwrap();
    assert!(
        result
            .citations
            .iter()
            .any(|c| c.text == "The sky is blue." && c.source == "notes.txt"),
        "answer: {}",
        result.answer
    );

    // The same upload again is a no-op rather than a third document.
    let again = pipeline
        .ingest_file("notes.txt", b"The sky is blue.", None)
        .await
        .unwrap();
    assert_eq!(again.document_id, first.document_id);
    assert_eq!(pipeline.stats().await.unwrap().total_documents, 2);
}

#[tokio::test]
async fn test_ingest_failure_is_tagged_with_its_stage() {
    let pipeline = Pipeline::new(
        test_config(),
        Box::new(DisabledProvider),
        Box::new(LexicalReranker),
        Box::new(ExtractiveProvider),
        Box::new(MemoryIndex::new("test")),
    );
    let err = pipeline
        .ingest_text("The sky is blue.", Some("Facts"), None)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Embedding));
    assert_eq!(pipeline.stats().await.unwrap().total_vectors, 0);
}

// ─── Clearing ───────────────────────────────────────────────────────

fn gated_pipeline(embedder: SlowEmbedder, events: Arc<Mutex<Vec<String>>>) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(
        test_config(),
        Box::new(embedder),
        Box::new(LexicalReranker),
        Box::new(ExtractiveProvider),
        Box::new(RecordingIndex {
            inner: MemoryIndex::new("gated"),
            events,
        }),
    ))
}

#[tokio::test]
async fn test_clear_waits_for_in_flight_ingest() {
    let embedder = SlowEmbedder::new(Duration::from_millis(500));
    let started = embedder.started.clone();
    let events = Arc::new(Mutex::new(Vec::new()));
    let pipeline = gated_pipeline(embedder, events.clone());

    let p = pipeline.clone();
    let ingest = tokio::spawn(async move {
        p.ingest_text("The river flows slowly to the sea.", Some("River"), Some("river.md"))
            .await
    });
    started.notified().await;

    let p = pipeline.clone();
    let clear = tokio::spawn(async move { p.clear().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!clear.is_finished(), "clear must wait for the ingest");

    ingest.await.unwrap().unwrap();
    clear.await.unwrap().unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["upsert river.md", "clear"]);
    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.total_vectors, 0);
    assert_eq!(stats.total_documents, 0);
}

#[tokio::test]
async fn test_ingest_queued_behind_clear_lands_after_it() {
    let embedder = SlowEmbedder::new(Duration::from_millis(500));
    let started = embedder.started.clone();
    let events = Arc::new(Mutex::new(Vec::new()));
    let pipeline = gated_pipeline(embedder, events.clone());

    let p = pipeline.clone();
    let first = tokio::spawn(async move {
        p.ingest_text("The river flows slowly to the sea.", Some("River"), Some("river.md"))
            .await
    });
    started.notified().await;

    let p = pipeline.clone();
    let clear = tokio::spawn(async move { p.clear().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let p = pipeline.clone();
    let second = tokio::spawn(async move {
        p.ingest_text(
            "Express shipping takes two days.",
            Some("Shipping"),
            Some("shipping.md"),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished(), "ingest must queue behind the clear");

    // Queries fail fast instead of queueing while the clear is pending.
    let err = pipeline
        .query("How long does shipping take?", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::ClearInProgress));

    first.await.unwrap().unwrap();
    clear.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec!["upsert river.md", "clear", "upsert shipping.md"]
    );
    let chunks = pipeline.list_chunks(10).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].source, "shipping.md");
}

#[tokio::test]
async fn test_timed_out_ingest_leaves_no_partial_records() {
    let embedder = SlowEmbedder::new(Duration::from_secs(30));
    let calls = embedder.calls.clone();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut config = test_config();
    config.embedding.batch_size = 1;
    let pipeline = Pipeline::new(
        config,
        Box::new(embedder),
        Box::new(LexicalReranker),
        Box::new(ExtractiveProvider),
        Box::new(RecordingIndex {
            inner: MemoryIndex::new("timeout"),
            events: events.clone(),
        }),
    );

    // Only the last chunk stalls, so earlier batches are already embedded.
    let sentence = "Rivers carry water from mountains toward the sea daily.";
    let text = format!("{} The tide came in slowly.", vec![sentence; 300].join(" "));
    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        pipeline.ingest_text(&text, Some("Rivers"), Some("rivers.txt")),
    )
    .await;
    assert!(outcome.is_err(), "ingest should have timed out");
    assert!(calls.load(Ordering::SeqCst) >= 2);

    assert!(events.lock().unwrap().is_empty());
    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.total_vectors, 0);
    assert_eq!(stats.total_documents, 0);

    // The dropped ingest released the gate.
    tokio::time::timeout(Duration::from_secs(1), pipeline.clear())
        .await
        .expect("clear should not block")
        .unwrap();
}
