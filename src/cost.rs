//! Per-query cost estimate from an injected [`PriceTable`].

use crate::config::PriceTable;
use crate::models::{round_to, TokenUsage};

/// Which stages of a query called a paid provider.
///
/// Offline providers (hash embeddings, lexical rerank, extractive answers)
/// are never billed, whatever the price table says.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Billed {
    pub embedding: bool,
    /// The reranker is billable and actually produced scores.
    pub rerank: bool,
    pub generation: bool,
}

/// Estimated spend for one query, rounded to six decimals.
///
/// - embedding: `query_tokens / 1000 × embedding_per_1k_tokens`
/// - rerank: `rerank_per_search`
/// - generation: prompt and completion tokens at their per-1K prices
///
/// Each term is charged only when the matching flag in `billed` is set.
pub fn estimate_cost(
    prices: &PriceTable,
    query_tokens: usize,
    billed: Billed,
    usage: &TokenUsage,
) -> f64 {
    let mut cost = 0.0;
    if billed.embedding {
        cost += query_tokens as f64 / 1000.0 * prices.embedding_per_1k_tokens;
    }
    if billed.rerank {
        cost += prices.rerank_per_search;
    }
    if billed.generation {
        cost += usage.prompt_tokens as f64 / 1000.0 * prices.prompt_per_1k_tokens;
        cost += usage.completion_tokens as f64 / 1000.0 * prices.completion_per_1k_tokens;
    }
    round_to(cost, 6)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: Billed = Billed {
        embedding: true,
        rerank: true,
        generation: true,
    };

    fn usage() -> TokenUsage {
        TokenUsage {
            prompt_tokens: 2000,
            completion_tokens: 500,
            total_tokens: 2500,
        }
    }

    #[test]
    fn test_default_prices() {
        // 0.0014 + 0.0004 + 0.001 + 10 tokens of embedding (0.0000002)
        let cost = estimate_cost(&PriceTable::default(), 10, ALL, &usage());
        assert!((cost - 0.0028).abs() < 1e-9);
    }

    #[test]
    fn test_rerank_charged_only_when_billed() {
        let prices = PriceTable {
            embedding_per_1k_tokens: 0.0,
            rerank_per_search: 0.5,
            prompt_per_1k_tokens: 0.0,
            completion_per_1k_tokens: 0.0,
        };
        let usage = TokenUsage::default();
        assert_eq!(estimate_cost(&prices, 5, ALL, &usage), 0.5);
        let unbilled = Billed {
            rerank: false,
            ..ALL
        };
        assert_eq!(estimate_cost(&prices, 5, unbilled, &usage), 0.0);
    }

    #[test]
    fn test_offline_run_costs_nothing() {
        let cost = estimate_cost(&PriceTable::default(), 1000, Billed::default(), &usage());
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn test_only_generation_billed() {
        let billed = Billed {
            generation: true,
            ..Billed::default()
        };
        let cost = estimate_cost(&PriceTable::default(), 1000, billed, &usage());
        assert!((cost - 0.0018).abs() < 1e-9);
    }
}
