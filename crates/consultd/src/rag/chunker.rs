//! Windowed text chunker with word-boundary backtracking.
//!
//! Text is whitespace-normalised first, then split into windows of at most
//! `chunk_size` characters. When a window would cut a word, the boundary
//! moves back to the last space in the final 40% of the window; successive
//! windows overlap by `overlap` characters so context survives the cut.

#[derive(Debug, Clone, Copy)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 150,
        }
    }
}

/// Collapse all whitespace runs to single spaces and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn chunk_text(text: &str, config: ChunkConfig) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = normalized.chars().collect();
    if chars.len() <= config.chunk_size {
        return vec![normalized];
    }

    let min_break = (config.chunk_size as f64 * 0.6).floor() as usize;
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + config.chunk_size).min(chars.len());
        if end < chars.len() {
            // Break at the last space in the window, provided it keeps the
            // chunk at least 60% full.
            let floor = start + min_break;
            if let Some(space_at) = (floor..end).rev().find(|&i| chars[i] == ' ') {
                end = space_at;
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            chunks.push(piece);
        }

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(config.overlap);
    }

    chunks
}

/// Crude token estimate: whitespace-split word count times 1.3, floor one.
pub fn estimate_tokens(text: &str) -> i32 {
    let words = text.split_whitespace().filter(|w| !w.is_empty()).count();
    ((words as f64 * 1.3).ceil() as i32).max(1)
}
