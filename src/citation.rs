//! Citation mapping.
//!
//! Answer text from a generator is untrusted. [`map_citations`] finds the
//! bracketed markers in it, checks every referenced number against the
//! passages that were actually supplied, and returns:
//!
//! - one [`Citation`] per distinct valid number, ascending
//! - the answer with invalid markers removed (a list marker such as
//!   `[1, 7]` keeps only its valid members)
//! - the invalid markers, for a [`Warning::CitationIntegrity`]
//!
//! Bracketed text that does not start with a digit is prose and is left
//! alone. The mapping is pure and idempotent.
//!
//! [`Warning::CitationIntegrity`]: crate::error::Warning::CitationIntegrity

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{Citation, RerankedCandidate};

/// Output of [`map_citations`].
#[derive(Debug, Clone, PartialEq)]
pub struct CitationMap {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub invalid_markers: Vec<String>,
}

fn marker_regex() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"\[([^\[\]]*)\]").expect("marker pattern is valid"))
}

enum Marker<'a> {
    /// Not a citation marker at all.
    Prose,
    /// Starts with a digit but is not a comma-separated number list.
    Malformed,
    /// Each member as written, with its value when it fits in a `usize`.
    List(Vec<(Option<usize>, &'a str)>),
}

fn classify(content: &str) -> Marker<'_> {
    let content = content.trim();
    if !content.starts_with(|c: char| c.is_ascii_digit()) {
        return Marker::Prose;
    }
    let mut members = Vec::new();
    for part in content.split(',') {
        let part = part.trim();
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return Marker::Malformed;
        }
        members.push((part.parse::<usize>().ok(), part));
    }
    Marker::List(members)
}

struct Pass {
    text: String,
    cited: BTreeSet<usize>,
    invalid: Vec<String>,
}

/// One left-to-right pass over the markers of `answer`.
fn scrub(answer: &str, passages: usize) -> Pass {
    let valid = 1..=passages;
    let mut cited = BTreeSet::new();
    let mut invalid = Vec::new();
    let mut out = String::with_capacity(answer.len());
    let mut last = 0;

    for caps in marker_regex().captures_iter(answer) {
        let Some(whole) = caps.get(0) else { continue };
        let content = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

        let replacement = match classify(content) {
            Marker::Prose => continue,
            Marker::Malformed => {
                invalid.push(whole.as_str().to_string());
                None
            }
            Marker::List(members) => {
                let mut kept = Vec::new();
                let mut dropped = 0;
                for (number, written) in members {
                    // Overflowing numbers are out of range for any passage list.
                    match number.filter(|n| valid.contains(n)) {
                        Some(n) => kept.push(n),
                        None => {
                            invalid.push(format!("[{}]", written));
                            dropped += 1;
                        }
                    }
                }
                cited.extend(kept.iter().copied());
                if kept.is_empty() {
                    None
                } else if dropped == 0 {
                    Some(whole.as_str().to_string())
                } else {
                    let list: Vec<String> = kept.iter().map(|n| n.to_string()).collect();
                    Some(format!("[{}]", list.join(", ")))
                }
            }
        };

        out.push_str(&answer[last..whole.start()]);
        match replacement {
            Some(marker) => out.push_str(&marker),
            None => {
                // Drop the space that separated the removed marker.
                if out.ends_with(' ') {
                    out.pop();
                }
            }
        }
        last = whole.end();
    }
    out.push_str(&answer[last..]);

    Pass {
        text: out,
        cited,
        invalid,
    }
}

/// Validate citation markers in `answer` against `reranked`.
pub fn map_citations(answer: &str, reranked: &[RerankedCandidate]) -> CitationMap {
    let mut text = answer.to_string();
    let mut invalid_markers = Vec::new();
    // Removing a marker can join its neighbours into a new one ("[1[7]]"),
    // so scrub until a pass finds nothing invalid.
    let cited = loop {
        let pass = scrub(&text, reranked.len());
        text = pass.text;
        if pass.invalid.is_empty() {
            break pass.cited;
        }
        invalid_markers.extend(pass.invalid);
    };
    let out = text;

    if !invalid_markers.is_empty() {
        tracing::warn!(
            markers = ?invalid_markers,
            passages = reranked.len(),
            "answer contained invalid citation markers"
        );
    }

    let citations = cited
        .into_iter()
        .map(|n| {
            let c = &reranked[n - 1];
            Citation {
                number: n,
                title: c.chunk.title.clone(),
                source: c.chunk.source.clone(),
                relevance_score: c.relevance,
                text: c.chunk.text.clone(),
                document_id: c.chunk.document_id.clone(),
                chunk_id: c.chunk.id.clone(),
                position: c.chunk.position,
            }
        })
        .collect();

    CitationMap {
        answer: out,
        citations,
        invalid_markers,
    }
}

/// Every citation number referenced by markers in `answer`, ascending.
pub fn marker_numbers(answer: &str) -> BTreeSet<usize> {
    marker_regex()
        .captures_iter(answer)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| match classify(m.as_str()) {
            Marker::List(members) => Some(members),
            _ => None,
        })
        .flatten()
        .filter_map(|(number, _)| number)
        .collect()
}
