//! Second-stage relevance scoring.
//!
//! A [`RerankProvider`] scores `(query, passage)` pairs; [`rerank`] orders
//! the retriever's candidates by that score, keeps the best
//! `rerank_top_k`, and numbers them `1..=N` for citation.
//!
//! When the provider fails (or returns the wrong number of scores) the
//! candidates keep their similarity order, relevance becomes the min-max
//! normalized similarity, and the outcome is flagged as degraded.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::config::RerankConfig;
use crate::error::ProviderError;
use crate::http;
use crate::models::{RerankedCandidate, RetrievedCandidate};

/// Scores closer than this are treated as equal.
pub const SCORE_EPSILON: f64 = 1e-9;

#[async_trait]
pub trait RerankProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a search is charged by a hosted service.
    fn billable(&self) -> bool {
        true
    }

    /// One relevance score per document, in input order.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ProviderError>;
}

/// Result of a rerank pass.
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub candidates: Vec<RerankedCandidate>,
    /// Diagnostic code when the similarity fallback was used.
    pub degraded: Option<String>,
    /// Whether the provider produced usable scores.
    pub provider_ran: bool,
}

/// Rerank `candidates` (in retriever order) and keep at most `top_k`.
pub async fn rerank(
    provider: &dyn RerankProvider,
    query: &str,
    candidates: Vec<RetrievedCandidate>,
    top_k: usize,
) -> RerankOutcome {
    if candidates.is_empty() || top_k == 0 {
        return RerankOutcome {
            candidates: Vec::new(),
            degraded: None,
            provider_ran: false,
        };
    }

    let documents: Vec<String> = candidates.iter().map(|c| c.chunk.text.clone()).collect();
    let scores = match provider.score(query, &documents).await {
        Ok(scores) if scores.len() == candidates.len() => Ok(scores),
        Ok(scores) => {
            tracing::warn!(
                provider = provider.name(),
                expected = candidates.len(),
                got = scores.len(),
                "reranker returned the wrong number of scores"
            );
            Err("score_count_mismatch".to_string())
        }
        Err(e) => {
            tracing::warn!(provider = provider.name(), code = e.code(), "reranker unavailable");
            Err(e.code().to_string())
        }
    };

    match scores {
        Ok(scores) => {
            let relevance: Vec<f64> = scores.into_iter().map(clamp_unit).collect();
            let order = stable_order(&relevance);
            let ranked = order
                .into_iter()
                .take(top_k)
                .map(|i| (relevance[i], candidates[i].clone()))
                .collect();
            RerankOutcome {
                candidates: number(ranked),
                degraded: None,
                provider_ran: true,
            }
        }
        Err(code) => {
            let relevance = normalize_similarities(&candidates);
            let ranked = relevance
                .into_iter()
                .zip(candidates)
                .take(top_k)
                .collect();
            RerankOutcome {
                candidates: number(ranked),
                degraded: Some(code),
                provider_ran: false,
            }
        }
    }
}

fn clamp_unit(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Indices sorted by descending score; scores within [`SCORE_EPSILON`] of
/// their neighbour keep their original relative order.
fn stable_order(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end - 1]] - scores[order[end]] <= SCORE_EPSILON {
            end += 1;
        }
        order[start..end].sort_unstable();
        start = end;
    }
    order
}

/// Min-max normalize similarities into `[0, 1]`; all-equal maps to `1.0`.
fn normalize_similarities(candidates: &[RetrievedCandidate]) -> Vec<f64> {
    let s_min = candidates
        .iter()
        .map(|c| c.similarity)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.similarity)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.similarity - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

fn number(ranked: Vec<(f64, RetrievedCandidate)>) -> Vec<RerankedCandidate> {
    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (relevance, c))| RerankedCandidate {
            citation_number: i + 1,
            relevance,
            similarity: c.similarity,
            chunk: c.chunk,
        })
        .collect()
}

// ============ Disabled Provider ============

/// Always unavailable; every rerank runs in degraded mode.
pub struct DisabledReranker;

#[async_trait]
impl RerankProvider for DisabledReranker {
    fn name(&self) -> &str {
        "disabled"
    }
    fn billable(&self) -> bool {
        false
    }
    async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f64>, ProviderError> {
        Err(ProviderError::unavailable("rerank_disabled"))
    }
}

// ============ Lexical Provider ============

/// Offline scorer: the fraction of distinct query terms that occur in the
/// passage.
pub struct LexicalReranker;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "what", "which", "who", "whom", "how", "why",
    "when", "where", "does", "did", "this", "that", "with", "from", "about", "into", "has",
    "have", "had", "you", "your", "can", "not",
];

/// Lowercased content words of `text` (longer than two characters, not a
/// stopword).
pub(crate) fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

#[async_trait]
impl RerankProvider for LexicalReranker {
    fn name(&self) -> &str {
        "lexical"
    }
    fn billable(&self) -> bool {
        false
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ProviderError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(vec![0.0; documents.len()]);
        }
        Ok(documents
            .iter()
            .map(|doc| {
                let doc_terms = terms(doc);
                let hits = query_terms.iter().filter(|t| doc_terms.contains(*t)).count();
                hits as f64 / query_terms.len() as f64
            })
            .collect())
    }
}

// ============ Cohere Provider ============

/// Cohere `v2/rerank` (or a compatible endpoint).
pub struct CohereReranker {
    model: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl CohereReranker {
    pub fn new(config: &RerankConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            model: config.model.clone(),
            url: config.url.clone(),
            api_key: http::api_key(&config.api_key_env)?,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl RerankProvider for CohereReranker {
    fn name(&self) -> &str {
        "cohere"
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": documents.len(),
        });
        let json = http::post_json(&self.client, "cohere", &self.url, Some(&self.api_key), &body)
            .await?;
        parse_cohere_response(&json, documents.len())
    }
}

fn parse_cohere_response(
    json: &serde_json::Value,
    expected: usize,
) -> Result<Vec<f64>, ProviderError> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| ProviderError::fatal("bad_response"))?;

    let mut scores: Vec<Option<f64>> = vec![None; expected];
    for item in results {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .filter(|i| *i < expected)
            .ok_or_else(|| ProviderError::fatal("bad_response"))?;
        let score = item
            .get("relevance_score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| ProviderError::fatal("bad_response"))?;
        scores[index] = Some(score);
    }

    scores
        .into_iter()
        .map(|s| s.ok_or_else(|| ProviderError::fatal("bad_response")))
        .collect()
}

/// Create the reranker named in `[rerank] provider`.
pub fn create_reranker(config: &RerankConfig) -> Result<Box<dyn RerankProvider>, ProviderError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledReranker)),
        "lexical" => Ok(Box::new(LexicalReranker)),
        "cohere" => Ok(Box::new(CohereReranker::new(config)?)),
        _ => Err(ProviderError::unavailable("unknown_provider")),
    }
}
