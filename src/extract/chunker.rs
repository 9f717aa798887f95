//! Text chunking with overlap
//!
//! Produces a sequence of character windows, preferring to break at word
//! boundaries when one falls in the second half of the window.

use crate::types::ChunkConfig;

/// Split text into overlapping chunks
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Vec<String> {
    let chunk_size = config.chunk_size.max(1);
    let overlap = config.overlap.min(chunk_size.saturating_sub(1));

    if text.is_empty() {
        return vec![];
    }

    if text.chars().count() <= chunk_size {
        return vec![text.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();

        // Break at a word boundary when one lands in the second half
        let chunk = if end < chars.len() {
            match chunk.rfind(|c: char| c.is_whitespace()) {
                Some(last_space) if last_space > chunk_size / 2 => chunk[..last_space].to_string(),
                _ => chunk,
            }
        } else {
            chunk
        };

        let chunk_char_count = chunk.chars().count();
        chunks.push(chunk);

        if start + chunk_char_count >= chars.len() {
            break;
        }

        let step = chunk_char_count.saturating_sub(overlap);
        start += if step == 0 { chunk_char_count } else { step };
    }

    chunks
}
