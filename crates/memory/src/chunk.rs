//! Text chunking for indexing.
//!
//! Sizes are expressed in estimated tokens (4 bytes each) so the same numbers
//! drive both the chunker and the memory budget.

const BYTES_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextChunker {
    /// `chunk_tokens` per chunk, with `overlap_tokens` carried into the next one.
    pub fn new(chunk_tokens: usize, overlap_tokens: usize) -> Self {
        let chunk_size = chunk_tokens.max(1) * BYTES_PER_TOKEN;
        let chunk_overlap = (overlap_tokens * BYTES_PER_TOKEN).min(chunk_size - 1);
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if text.len() <= self.chunk_size {
            return vec![Chunk {
                index: 0,
                text: text.to_string(),
                start_offset: 0,
                end_offset: text.len(),
            }];
        }

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let end = snap_to_char_boundary(text, start + self.chunk_size);
            let actual_end = if end < text.len() {
                self.find_break_point(text, start, end)
            } else {
                end
            };

            let piece = text[start..actual_end].trim();
            if !piece.is_empty() {
                chunks.push(Chunk {
                    index: chunks.len(),
                    text: piece.to_string(),
                    start_offset: start,
                    end_offset: actual_end,
                });
            }
            if actual_end >= text.len() {
                break;
            }

            let step = (actual_end - start).saturating_sub(self.chunk_overlap).max(1);
            let mut next = snap_to_char_boundary(text, start + step);
            if next <= start {
                next = actual_end;
            }
            start = next;
        }

        chunks
    }

    /// Prefer a paragraph break, then a sentence end, then a newline, then a space,
    /// searching the last quarter of the window.
    fn find_break_point(&self, text: &str, start: usize, preferred_end: usize) -> usize {
        let window = (self.chunk_size / 4).max(1);
        let search_start = snap_to_char_boundary(text, preferred_end.saturating_sub(window).max(start));
        if search_start >= preferred_end {
            return preferred_end;
        }
        let region = &text[search_start..preferred_end];

        for (pattern, skip) in [("\n\n", 2), (". ", 2), (".\n", 2), ("\n", 1), (" ", 1)] {
            if let Some(pos) = region.rfind(pattern) {
                let at = search_start + pos + skip;
                if at > start {
                    return at;
                }
            }
        }
        preferred_end
    }
}

/// Snap a byte offset down to the nearest UTF-8 char boundary.
fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}
