//! Splitting extracted documents into model-sized chunks.
//!
//! Highlights:
//!
//! - Lossless: chunk bodies are contiguous slices of the flattened document, so concatenating
//!   them (ignoring the overlap prefix) reproduces the document byte for byte.
//! - Bounded: every chunk, overlap included, fits in `max_units` as measured by the configured
//!   unit counter (characters, or `tiktoken-rs` tokens).
//! - Sentence aware: when a chunk has to be cut, the cut moves back to the nearest sentence or
//!   paragraph end within `sentence_window` characters; otherwise it lands on the hard limit.
//! - Overlap: the trailing `overlap` units of a chunk are repeated at the start of the next so
//!   each summarization call sees some of the preceding context.

use crate::config::ChunkUnit;
use anyhow::Error as TokenizerError;
use std::sync::Arc;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

use super::types::{Chunk, ChunkSet, ChunkingError, Document};

type UnitCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Knobs controlling how documents are chunked.
#[derive(Debug, Clone)]
pub struct ChunkerSettings {
    /// Hard upper bound on units per chunk.
    pub max_units: usize,
    /// Units of trailing context repeated into the next chunk.
    pub overlap: usize,
    /// Characters searched backward for a sentence end before cutting at the hard limit.
    pub sentence_window: usize,
    /// Unit used for `max_units` and `overlap`.
    pub unit: ChunkUnit,
    /// Tokenizer model or encoding name, used when `unit` is tokens.
    pub tokenizer_model: String,
}

/// Document chunker with a fixed unit counter.
#[derive(Clone)]
pub struct Chunker {
    max_units: usize,
    overlap: usize,
    sentence_window: usize,
    counter: UnitCounter,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("max_units", &self.max_units)
            .field("overlap", &self.overlap)
            .field("sentence_window", &self.sentence_window)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    /// Build a chunker from settings, loading a tokenizer when chunking by tokens.
    pub fn new(settings: &ChunkerSettings) -> Result<Self, ChunkingError> {
        let counter = match settings.unit {
            ChunkUnit::Chars => char_counter(),
            ChunkUnit::Tokens => build_tiktoken_counter(&settings.tokenizer_model)?,
        };
        Self::with_counter(
            settings.max_units,
            settings.overlap,
            settings.sentence_window,
            counter,
        )
    }

    /// Character-counting chunker.
    pub fn by_chars(
        max_units: usize,
        overlap: usize,
        sentence_window: usize,
    ) -> Result<Self, ChunkingError> {
        Self::with_counter(max_units, overlap, sentence_window, char_counter())
    }

    fn with_counter(
        max_units: usize,
        overlap: usize,
        sentence_window: usize,
        counter: UnitCounter,
    ) -> Result<Self, ChunkingError> {
        if max_units == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        Ok(Self {
            max_units,
            // Half the budget at most, so every chunk still advances through the document.
            overlap: overlap.min(max_units / 2),
            sentence_window,
            counter,
        })
    }

    /// Count units in `text` with this chunker's counter.
    pub fn count_units(&self, text: &str) -> usize {
        self.counter.as_ref()(text)
    }

    /// Split a document into ordered chunks.
    ///
    /// A document without any text yields a single empty chunk with
    /// [`ChunkSet::empty_document`] set, so callers can exit early instead of summarizing it.
    pub fn split(&self, document: &Document) -> ChunkSet {
        if document.is_blank() {
            return ChunkSet {
                chunks: vec![Chunk {
                    index: 0,
                    text: String::new(),
                    overlap_len: 0,
                    offset: 0,
                }],
                empty_document: true,
            };
        }

        let text = document.text();
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut prefix = String::new();

        while start < text.len() {
            let hard_end = self.longest_fit(&text, start, &prefix);
            let end = if hard_end == text.len() {
                hard_end
            } else {
                match sentence_boundary(&text, start, hard_end, self.sentence_window) {
                    Some(boundary) if self.fits(&text, start, &prefix, boundary) => boundary,
                    _ => hard_end,
                }
            };

            let body = &text[start..end];
            let mut chunk_text = String::with_capacity(prefix.len() + body.len());
            chunk_text.push_str(&prefix);
            chunk_text.push_str(body);
            chunks.push(Chunk {
                index: chunks.len(),
                text: chunk_text,
                overlap_len: prefix.len(),
                offset: start,
            });

            prefix = if self.overlap == 0 {
                String::new()
            } else {
                tail_with_unit_limit(body, self.overlap, &self.counter).to_string()
            };
            start = end;
        }

        tracing::debug!(
            chunks = chunks.len(),
            max_units = self.max_units,
            overlap = self.overlap,
            "Split document"
        );
        ChunkSet {
            chunks,
            empty_document: false,
        }
    }

    fn fits(&self, text: &str, start: usize, prefix: &str, end: usize) -> bool {
        let mut candidate = String::with_capacity(prefix.len() + end - start);
        candidate.push_str(prefix);
        candidate.push_str(&text[start..end]);
        self.counter.as_ref()(&candidate) <= self.max_units
    }

    /// Largest char-boundary `end` such that `prefix + text[start..end]` fits the budget.
    ///
    /// Always advances by at least one character. The search window grows geometrically from
    /// `start`, so the segments handed to the counter stay proportional to one chunk rather
    /// than to the rest of the document.
    fn longest_fit(&self, text: &str, start: usize, prefix: &str) -> usize {
        let fits = |end: usize| self.fits(text, start, prefix, end);

        let first = next_char_boundary(text, start);
        if !fits(first) || first == text.len() {
            return first;
        }

        // A unit is at most four bytes of UTF-8 in char mode and rarely more in token mode.
        let mut step = self.max_units.saturating_mul(4);
        let mut lo = first;
        let mut hi = loop {
            let candidate = ceil_char_boundary(text, start.saturating_add(step).min(text.len()));
            if candidate > lo {
                if !fits(candidate) {
                    break candidate;
                }
                if candidate == text.len() {
                    return candidate;
                }
                lo = candidate;
            }
            step = step.saturating_mul(2);
        };

        while lo < hi {
            let mut mid = floor_char_boundary(text, lo + (hi - lo) / 2);
            if mid <= lo {
                mid = next_char_boundary(text, lo);
                if mid >= hi {
                    break;
                }
            }
            if fits(mid) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// Find the latest sentence or paragraph end in the `window` characters before `hard_end`.
///
/// The returned offset sits after the terminator and any whitespace that follows it, never
/// past `hard_end`, and always after `start`.
fn sentence_boundary(text: &str, start: usize, hard_end: usize, window: usize) -> Option<usize> {
    let mut next = text[hard_end..].chars().next();
    for (offset, c) in text[start..hard_end].char_indices().rev().take(window) {
        let position = start + offset;
        let is_sentence_end =
            matches!(c, '.' | '!' | '?') && next.is_none_or(char::is_whitespace);
        let is_paragraph_end = c == '\n' && next == Some('\n');
        if is_sentence_end || is_paragraph_end {
            let mut split = position + c.len_utf8();
            while let Some(ws) = text[split..hard_end].chars().next() {
                if !ws.is_whitespace() {
                    break;
                }
                split += ws.len_utf8();
            }
            if split > start {
                return Some(split);
            }
        }
        next = Some(c);
    }
    None
}

fn next_char_boundary(text: &str, index: usize) -> usize {
    text[index..]
        .chars()
        .next()
        .map(|c| index + c.len_utf8())
        .unwrap_or(text.len())
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Longest suffix of `text` whose unit count stays within `unit_limit`.
fn tail_with_unit_limit<'a>(text: &'a str, unit_limit: usize, counter: &UnitCounter) -> &'a str {
    if unit_limit == 0 {
        return "";
    }
    if counter.as_ref()(text) <= unit_limit {
        return text;
    }

    let (mut lo, mut hi) = (0usize, text.len());
    // `hi` always fits (the empty suffix does), `lo` never does.
    while hi - lo > 1 {
        let mid = floor_char_boundary(text, lo + (hi - lo) / 2);
        let mid = if mid <= lo {
            next_char_boundary(text, lo)
        } else {
            mid
        };
        if mid >= hi {
            break;
        }
        if counter.as_ref()(&text[mid..]) <= unit_limit {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    &text[hi..]
}

fn char_counter() -> UnitCounter {
    Arc::new(|segment: &str| segment.chars().count())
}

fn build_tiktoken_counter(model: &str) -> Result<UnitCounter, ChunkingError> {
    let normalized = model.trim();
    let target = if normalized.is_empty() {
        "cl100k_base"
    } else {
        normalized
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);

    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    if let Some(candidate) = encoding_from_name(model) {
        return candidate;
    }
    match get_bpe_from_model(model) {
        Ok(encoding) => Ok(encoding),
        Err(model_err) => {
            tracing::warn!(
                model,
                error = %model_err,
                "Unknown tokenizer model; falling back to 'cl100k_base'"
            );
            cl100k_base()
        }
    }
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "p50k_edit" => Some(p50k_edit()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}
