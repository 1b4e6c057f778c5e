//! Prompt construction for grounded answering.
//!
//! Passages are enumerated `[n]: <title> — <text>` in rerank order,
//! starting at 1. The system message restricts the model to those
//! passages and asks for a bracketed citation after every claim.

use crate::models::RerankedCandidate;

/// Fixed answer used when a passage set gives no grounds to answer.
pub const NOT_ENOUGH_INFORMATION: &str =
    "I don't have enough information to answer this question based on the provided documents.";

/// Fixed answer used when retrieval produced nothing to generate from.
pub const NO_RELEVANT_INFORMATION: &str = "I couldn't find any relevant information in the knowledge base to answer your question. Try adding relevant documents or rephrasing the question.";

const SYSTEM_PROMPT: &str = "You answer questions using only the numbered passages supplied by the user.

Rules:
1. Use only facts stated in the passages. Do not rely on outside knowledge.
2. Cite every claim with the bracketed number of the passage that supports it, e.g. [1] or [2, 3].
3. Only cite numbers that appear in the passage list.
4. If the passages do not contain the answer, reply exactly: \"I don't have enough information to answer this question based on the provided documents.\"
5. Keep the answer concise.";

/// One numbered passage as shown to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPassage {
    pub number: usize,
    pub title: String,
    pub text: String,
}

/// A two-message chat prompt plus the passages it was built from.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub question: String,
    pub passages: Vec<PromptPassage>,
}

/// Build the prompt for `question` over `reranked` passages.
pub fn build_prompt(question: &str, reranked: &[RerankedCandidate]) -> Prompt {
    let passages: Vec<PromptPassage> = reranked
        .iter()
        .map(|c| PromptPassage {
            number: c.citation_number,
            title: display_title(&c.chunk.title, &c.chunk.source),
            text: c.chunk.text.trim().to_string(),
        })
        .collect();

    let context = passages
        .iter()
        .map(|p| format!("[{}]: {} — {}", p.number, p.title, p.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    let user = format!(
        "Passages:\n{}\n\nQuestion: {}\n\nAnswer using only the passages above and cite them as [n].",
        context,
        question.trim()
    );

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        question: question.trim().to_string(),
        passages,
    }
}

fn display_title(title: &str, source: &str) -> String {
    if !title.trim().is_empty() {
        title.trim().to_string()
    } else if !source.trim().is_empty() {
        source.trim().to_string()
    } else {
        "Untitled".to_string()
    }
}
