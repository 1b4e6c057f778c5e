//! Gold-set evaluation (`ans eval <gold.json>`).
//!
//! A gold set is a JSON array of questions with the keywords a good answer
//! should contain:
//!
//! ```json
//! [
//!   { "id": 1, "question": "What is the return window?",
//!     "expected_keywords": ["45", "days", "refund"], "min_citations": 1,
//!     "expected_source": "Returns Policy" },
//!   { "id": 2, "question": "What is the vacation policy?",
//!     "expected_keywords": [], "min_citations": 0, "should_fail": true }
//! ]
//! ```
//!
//! A normal item passes when at least half of its keywords appear in the
//! answer, it has enough citations, and the answer is not a refusal. A
//! `should_fail` item passes when the answer is a refusal.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::round_to;
use crate::pipeline::Pipeline;

/// Minimum fraction of expected keywords for a normal item to pass.
pub const KEYWORD_THRESHOLD: f64 = 0.5;

/// Success rate below which `ans eval` exits non-zero.
pub const SUCCESS_THRESHOLD: f64 = 0.6;

/// Phrases that mark an answer as "no answer".
pub const NO_ANSWER_PHRASES: &[&str] = &[
    "couldn't find",
    "don't have enough",
    "no relevant",
    "unable to answer",
    "not mentioned",
    "no information",
];

#[derive(Debug, Clone, Deserialize)]
pub struct GoldItem {
    pub id: u32,
    pub question: String,
    #[serde(default)]
    pub expected_keywords: Vec<String>,
    #[serde(default)]
    pub min_citations: usize,
    #[serde(default)]
    pub expected_source: Option<String>,
    #[serde(default)]
    pub should_fail: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalResult {
    pub id: u32,
    pub question: String,
    pub expected_source: Option<String>,
    pub answer: String,
    pub citation_count: usize,
    pub keyword_score: f64,
    pub has_enough_citations: bool,
    pub is_no_answer: bool,
    /// Whether a cited passage's title or source mentions `expected_source`.
    pub source_matched: Option<bool>,
    pub should_fail: bool,
    pub retrieval_time_ms: f64,
    pub rerank_time_ms: f64,
    pub generation_time_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub total_queries: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub avg_keyword_score: f64,
    pub avg_citations: f64,
    pub avg_retrieval_time_ms: f64,
    pub avg_rerank_time_ms: f64,
    pub avg_generation_time_ms: f64,
    pub passed: bool,
    pub detailed_results: Vec<EvalResult>,
}

pub fn load_gold_set(path: &Path) -> Result<Vec<GoldItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read gold set: {}", path.display()))?;
    let items: Vec<GoldItem> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse gold set: {}", path.display()))?;
    if items.is_empty() {
        bail!("Gold set is empty: {}", path.display());
    }
    Ok(items)
}

pub fn is_no_answer(answer: &str) -> bool {
    let lower = answer.to_lowercase().replace('\u{2019}', "'");
    NO_ANSWER_PHRASES.iter().any(|p| lower.contains(p))
}

/// Fraction of `keywords` found (case-insensitively) in `answer`; `0.0`
/// when no keywords are expected.
pub fn keyword_score(answer: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let lower = answer.to_lowercase();
    let found = keywords
        .iter()
        .filter(|k| lower.contains(&k.to_lowercase()))
        .count();
    found as f64 / keywords.len() as f64
}

pub async fn evaluate_item(pipeline: &Pipeline, item: &GoldItem) -> EvalResult {
    let mut result = EvalResult {
        id: item.id,
        question: item.question.clone(),
        expected_source: item.expected_source.clone(),
        answer: String::new(),
        citation_count: 0,
        keyword_score: 0.0,
        has_enough_citations: false,
        is_no_answer: false,
        source_matched: None,
        should_fail: item.should_fail,
        retrieval_time_ms: 0.0,
        rerank_time_ms: 0.0,
        generation_time_ms: 0.0,
        success: false,
        error: None,
    };

    let answer = match pipeline.query(&item.question, None, None).await {
        Ok(answer) => answer,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };

    result.keyword_score = keyword_score(&answer.answer, &item.expected_keywords);
    result.citation_count = answer.citations.len();
    result.has_enough_citations = result.citation_count >= item.min_citations;
    result.is_no_answer = is_no_answer(&answer.answer);
    result.source_matched = item.expected_source.as_ref().map(|expected| {
        let expected = expected.to_lowercase();
        answer.citations.iter().any(|c| {
            c.title.to_lowercase().contains(&expected) || c.source.to_lowercase().contains(&expected)
        })
    });
    result.retrieval_time_ms = answer.timings.retrieval_time_ms;
    result.rerank_time_ms = answer.timings.rerank_time_ms;
    result.generation_time_ms = answer.timings.generation_time_ms;
    result.success = if item.should_fail {
        result.is_no_answer
    } else {
        result.keyword_score >= KEYWORD_THRESHOLD
            && result.has_enough_citations
            && !result.is_no_answer
    };
    result.answer = answer.answer;
    result
}

/// Run every gold item and aggregate the results.
pub async fn run_eval(pipeline: &Pipeline, items: &[GoldItem]) -> EvalSummary {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        tracing::debug!(id = item.id, "evaluating gold item");
        results.push(evaluate_item(pipeline, item).await);
    }
    summarize(results)
}

fn summarize(results: Vec<EvalResult>) -> EvalSummary {
    let total = results.len();
    let n = total.max(1) as f64;
    let avg = |f: fn(&EvalResult) -> f64| round_to(results.iter().map(f).sum::<f64>() / n, 2);
    let successful = results.iter().filter(|r| r.success).count();
    let success_rate = successful as f64 / n;

    EvalSummary {
        total_queries: total,
        successful,
        success_rate: round_to(success_rate, 4),
        avg_keyword_score: avg(|r| r.keyword_score),
        avg_citations: avg(|r| r.citation_count as f64),
        avg_retrieval_time_ms: avg(|r| r.retrieval_time_ms),
        avg_rerank_time_ms: avg(|r| r.rerank_time_ms),
        avg_generation_time_ms: avg(|r| r.generation_time_ms),
        passed: total > 0 && success_rate >= SUCCESS_THRESHOLD,
        detailed_results: results,
    }
}
