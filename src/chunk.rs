//! Overlapping character-window chunker for text spaces.
//!
//! Text is cut into windows of at most `chunk_size` characters, consecutive
//! windows sharing `chunk_overlap` characters. A window prefers to end on
//! whitespace in its second half so words are not split.

use sha2::{Digest, Sha256};

/// One window of a text value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`; equal chunks of one row are embedded once.
    pub hash: String,
}

/// Split `text` into overlapping windows. Empty or whitespace-only text
/// yields no chunks.
pub fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<TextChunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= chunk_size {
        return vec![make_chunk(0, trimmed)];
    }

    let overlap = chunk_overlap.min(chunk_size.saturating_sub(1));
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + chunk_size).min(chars.len());
        let end = if hard_end < chars.len() {
            let floor = start + chunk_size / 2;
            (floor..hard_end)
                .rev()
                .find(|&i| chars[i].is_whitespace())
                .unwrap_or(hard_end)
        } else {
            hard_end
        };

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(make_chunk(chunks.len(), piece));
        }

        if end >= chars.len() {
            break;
        }
        let back = end.saturating_sub(overlap).max(start + 1);
        // Start the next window on a word boundary when there is one
        start = (back..end)
            .find(|&i| chars[i - 1].is_whitespace())
            .unwrap_or(back);
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
        if start >= chars.len() {
            break;
        }
    }

    chunks
}

fn make_chunk(index: usize, text: &str) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    TextChunk {
        index,
        text: text.to_string(),
        hash: format!("{:x}", hasher.finalize()),
    }
}
