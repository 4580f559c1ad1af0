//! Text chunking for embeddings.
//!
//! Splits normalized document text into overlapping fixed-size segments.
//! Deterministic: the same `(text, size, overlap)` always yields the same
//! chunks in the same order, so a restarted extraction re-derives an
//! identical chunk set.

use thiserror::Error;

/// Invalid chunking parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroSize,
    #[error("overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

/// Split `text` into chunks of at most `size` characters, with `overlap`
/// characters shared between consecutive chunks.
///
/// Counts characters, not bytes, so multi-byte text never splits inside a
/// code point. Text no longer than `size` comes back as a single chunk;
/// empty text yields no chunks.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<String>, ChunkError> {
    if size == 0 {
        return Err(ChunkError::ZeroSize);
    }
    if overlap >= size {
        return Err(ChunkError::OverlapTooLarge { size, overlap });
    }

    if text.is_empty() {
        return Ok(vec![]);
    }

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= size {
        return Ok(vec![text.to_string()]);
    }

    let step = size - overlap;
    let mut chunks = Vec::with_capacity(chars.len() / step + 1);
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }

    Ok(chunks)
}
