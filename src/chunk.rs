//! Sentence-boundary text chunker with sliding-window overlap.
//!
//! Splits document text into [`Chunk`]s that never cut a sentence in half
//! and never exceed a configurable `max_tokens` estimate. Sentences are
//! packed greedily; when the next sentence would overflow the budget the
//! chunk is closed and the next one starts with the trailing sentences of
//! the previous chunk, until at least `overlap_tokens` are repeated.
//!
//! A sentence that on its own exceeds `max_tokens` is hard-split at token
//! boundaries and emitted as standalone chunk(s) without overlap.
//!
//! Sentence spans include their trailing whitespace and the first sentence
//! starts at offset 0, so chunks laid end to end (minus the overlapped
//! regions) reproduce the input exactly.
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and position, plus a SHA-256 hash of its text.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, Document};

/// Characters that may follow terminal punctuation and still belong to
/// the sentence it ends.
const CLOSERS: &[char] = &['"', '\'', ')', ']', '\u{201d}', '\u{2019}'];

/// Location of one chunk inside its parent text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Character offset of the first character.
    pub start: usize,
    /// Character offset one past the last character.
    pub end: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub token_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sentence {
    start: usize,
    end: usize,
    tokens: usize,
}

/// Estimate the number of tokens in `text`.
///
/// A token is a maximal run of alphanumeric characters, or a single
/// character that is neither alphanumeric nor whitespace. Deterministic and
/// language-agnostic; `"The sky is blue."` is 5 tokens.
pub fn estimate_tokens(text: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if !in_word {
                count += 1;
                in_word = true;
            }
        } else {
            in_word = false;
            if !ch.is_whitespace() {
                count += 1;
            }
        }
    }
    count
}

/// Byte spans of every token in `text`, in order.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut word_start: Option<usize> = None;
    for (i, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            if word_start.is_none() {
                word_start = Some(i);
            }
            continue;
        }
        if let Some(s) = word_start.take() {
            spans.push((s, i));
        }
        if !ch.is_whitespace() {
            spans.push((i, i + ch.len_utf8()));
        }
    }
    if let Some(s) = word_start {
        spans.push((s, text.len()));
    }
    spans
}

/// Split `text` into sentence byte spans that tile `[0, text.len())`.
pub(crate) fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    let mut boundaries = Vec::new();

    let mut i = 0;
    while i < n {
        let ch = chars[i].1;
        if matches!(ch, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < n && (CLOSERS.contains(&chars[j].1) || matches!(chars[j].1, '.' | '!' | '?')) {
                j += 1;
            }
            if j < n && chars[j].1.is_whitespace() {
                let mut k = j;
                while k < n && chars[k].1.is_whitespace() {
                    k += 1;
                }
                if k < n {
                    boundaries.push(chars[k].0);
                }
                i = k;
            } else {
                i = j;
            }
            continue;
        }
        if ch == '\n' {
            // Paragraph break: a newline followed by another newline,
            // possibly with horizontal whitespace in between.
            let mut k = i + 1;
            let mut newlines = 1;
            while k < n && chars[k].1.is_whitespace() {
                if chars[k].1 == '\n' {
                    newlines += 1;
                }
                k += 1;
            }
            if newlines >= 2 && k < n {
                boundaries.push(chars[k].0);
            }
            i = k;
            continue;
        }
        i += 1;
    }

    let mut spans = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0;
    for b in boundaries {
        spans.push((start, b));
        start = b;
    }
    spans.push((start, text.len()));
    spans
}

/// Split text into overlapping, sentence-respecting chunk spans.
///
/// Returns an empty vector for empty or whitespace-only input.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<ChunkSpan> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let max_tokens = max_tokens.max(1);

    let sentences: Vec<Sentence> = sentence_spans(text)
        .into_iter()
        .map(|(start, end)| Sentence {
            start,
            end,
            tokens: estimate_tokens(&text[start..end]),
        })
        .collect();

    let mut out: Vec<(usize, usize)> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0;

    for (idx, sentence) in sentences.iter().enumerate() {
        if sentence.tokens > max_tokens {
            if !current.is_empty() {
                out.push(span_of(&sentences, &current));
                current.clear();
                current_tokens = 0;
            }
            hard_split(text, sentence, max_tokens, &mut out);
            continue;
        }

        if !current.is_empty() && current_tokens + sentence.tokens > max_tokens {
            out.push(span_of(&sentences, &current));
            let (overlap, overlap_total) = overlap_suffix(
                &sentences,
                &current,
                overlap_tokens,
                max_tokens - sentence.tokens,
            );
            current = overlap;
            current_tokens = overlap_total;
        }

        current.push(idx);
        current_tokens += sentence.tokens;
    }

    if !current.is_empty() {
        out.push(span_of(&sentences, &current));
    }

    out.into_iter()
        .map(|(byte_start, byte_end)| ChunkSpan {
            start: text[..byte_start].chars().count(),
            end: text[..byte_end].chars().count(),
            byte_start,
            byte_end,
            token_count: estimate_tokens(&text[byte_start..byte_end]),
        })
        .collect()
}

fn span_of(sentences: &[Sentence], indices: &[usize]) -> (usize, usize) {
    let first = sentences[indices[0]];
    let last = sentences[indices[indices.len() - 1]];
    (first.start, last.end)
}

/// Pick the trailing sentences of `current` to repeat at the head of the
/// next chunk. The suffix is strict (the first sentence is never repeated)
/// and is trimmed from the front until it fits within `cap` tokens.
fn overlap_suffix(
    sentences: &[Sentence],
    current: &[usize],
    overlap_tokens: usize,
    cap: usize,
) -> (Vec<usize>, usize) {
    if overlap_tokens == 0 {
        return (Vec::new(), 0);
    }

    let mut taken = Vec::new();
    let mut total = 0;
    for &i in current.iter().skip(1).rev() {
        taken.push(i);
        total += sentences[i].tokens;
        if total >= overlap_tokens {
            break;
        }
    }
    taken.reverse();

    let mut drop = 0;
    while total > cap && drop < taken.len() {
        total -= sentences[taken[drop]].tokens;
        drop += 1;
    }
    (taken.split_off(drop), total)
}

/// Cut an oversized sentence at token starts into pieces of at most
/// `max_tokens` tokens. The pieces tile the sentence span.
fn hard_split(text: &str, sentence: &Sentence, max_tokens: usize, out: &mut Vec<(usize, usize)>) {
    let tokens = token_spans(&text[sentence.start..sentence.end]);
    let mut piece_start = sentence.start;
    let mut i = max_tokens;
    while i < tokens.len() {
        let cut = sentence.start + tokens[i].0;
        out.push((piece_start, cut));
        piece_start = cut;
        i += max_tokens;
    }
    out.push((piece_start, sentence.end));
}

/// Chunk a document, binding each span to the document's identity.
///
/// Positions are contiguous starting at 0.
pub fn chunk_document(doc: &Document, max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    chunk_text(&doc.text, max_tokens, overlap_tokens)
        .into_iter()
        .enumerate()
        .map(|(position, span)| make_chunk(doc, position, span))
        .collect()
}

fn make_chunk(doc: &Document, position: usize, span: ChunkSpan) -> Chunk {
    let text = &doc.text[span.byte_start..span.byte_end];
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", doc.id, position).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        document_id: doc.id.clone(),
        position,
        start: span.start,
        end: span.end,
        token_count: span.token_count,
        title: doc.title.clone(),
        source: doc.source.clone(),
        text: text.to_string(),
        hash,
    }
}
