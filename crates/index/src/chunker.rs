//! Deterministic sliding-window segmentation of work notes.
//!
//! Token length is approximated as 4 characters per token, which holds up
//! reasonably for both Latin and CJK text. Windows are measured in `char`s so
//! a boundary never splits a UTF-8 sequence.
//!
//! Chunk text is not stored next to the vectors. [`Chunker::chunk_text`]
//! recomputes the slice for a stored `chunk_index` with the same boundary
//! formula [`Chunker::chunk`] uses, so both must stay in lockstep.

use crate::metadata::{ChunkMetadata, DocumentMetadata};

/// Characters per approximated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// A trailing fragment shorter than `chunk_chars / MIN_TAIL_DIVISOR` is dropped.
const MIN_TAIL_DIVISOR: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `"{document_id}#chunk{index}"`.
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkerConfig {
    pub chunk_size_tokens: usize,
    pub overlap_ratio: f64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: 512,
            overlap_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_chars: usize,
    step_chars: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

/// Build the deterministic id of a chunk.
pub fn chunk_id(document_id: &str, index: usize) -> String {
    format!("{document_id}#chunk{index}")
}

/// Join title and body the way they are embedded.
pub fn full_text(title: &str, body: &str) -> String {
    if title.is_empty() {
        body.to_string()
    } else {
        format!("{title}\n\n{body}")
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        let chunk_chars = config.chunk_size_tokens.max(1) * CHARS_PER_TOKEN;
        let overlap = config.overlap_ratio.clamp(0.0, 0.99);
        let step_chars = ((chunk_chars as f64) * (1.0 - overlap)).floor() as usize;
        Self {
            chunk_chars,
            step_chars: step_chars.max(1),
        }
    }

    pub fn chunk_chars(&self) -> usize {
        self.chunk_chars
    }

    pub fn step_chars(&self) -> usize {
        self.step_chars
    }

    /// Split a note into ordered chunks carrying per-chunk metadata.
    pub fn chunk(
        &self,
        document_id: &str,
        title: &str,
        body: &str,
        metadata: &DocumentMetadata,
    ) -> Vec<Chunk> {
        let text = full_text(title, body);
        self.windows(&text)
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| Chunk {
                id: chunk_id(document_id, index),
                text: text[start..end].to_string(),
                metadata: metadata.for_chunk(document_id, index),
            })
            .collect()
    }

    /// Reconstruct the text of chunk `index` from the note's full text.
    ///
    /// Returns `None` for any index [`Self::chunk`] did not produce,
    /// including a dropped short tail.
    pub fn chunk_text<'a>(&self, full_text: &'a str, index: usize) -> Option<&'a str> {
        let (start, end) = *self.windows(full_text).get(index)?;
        Some(&full_text[start..end])
    }

    /// Byte ranges of every window over `text`.
    fn windows(&self, text: &str) -> Vec<(usize, usize)> {
        let offsets = char_offsets(text);
        let total = offsets.len() - 1;
        if total <= self.chunk_chars {
            return vec![(0, text.len())];
        }

        let mut windows = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + self.chunk_chars).min(total);
            let is_short_tail = (end - start) * MIN_TAIL_DIVISOR < self.chunk_chars;
            if !windows.is_empty() && is_short_tail {
                break;
            }
            windows.push((offsets[start], offsets[end]));
            start += self.step_chars;
        }
        windows
    }
}

/// Byte offset of every char boundary, including `text.len()` at the end.
fn char_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect()
}
