//! Recursive character splitter.
//!
//! Walks a falling ladder of separators (paragraph, line, sentence, word)
//! to land chunks near the target size, hard-cutting at the character
//! level when nothing in the window breaks. Progress is monotonic: every
//! emitted chunk advances the cursor.

use serde_json::json;
use tracing::warn;

use super::{SplitPiece, SplitStream, Splitter, SplitterParams};
use crate::error::Result;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Separator-ladder splitter over characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecursiveSplitter;

impl RecursiveSplitter {
    pub fn new() -> Self {
        Self
    }
}

impl Splitter for RecursiveSplitter {
    fn name(&self) -> &'static str {
        "recursive"
    }

    fn split(&self, text: String, params: &SplitterParams) -> Result<SplitStream> {
        params.validate()?;
        Ok(Box::new(RecursiveIter {
            text,
            pos: 0,
            index: 0,
            chunk_size: params.chunk_size,
            overlap: params.chunk_overlap,
        }))
    }
}

struct RecursiveIter {
    text: String,
    /// Byte offset of the next chunk's start.
    pos: usize,
    index: u32,
    chunk_size: usize,
    overlap: usize,
}

impl Iterator for RecursiveIter {
    type Item = SplitPiece;

    fn next(&mut self) -> Option<SplitPiece> {
        if self.pos >= self.text.len() {
            return None;
        }

        let remaining = &self.text[self.pos..];
        let remaining_chars = remaining.chars().count();

        let (end, hard_cut) = if remaining_chars <= self.chunk_size {
            (remaining.len(), false)
        } else {
            let window_end = char_boundary(remaining, self.chunk_size);
            match best_break(&remaining[..window_end]) {
                Some(break_end) => (break_end, false),
                None => (window_end, true),
            }
        };

        let piece_text = remaining[..end].to_string();
        let mut metadata = json!({});
        if piece_text.chars().count() > self.chunk_size * 2 {
            warn!(
                index = self.index,
                chars = piece_text.chars().count(),
                "emitting oversized chunk"
            );
            metadata = json!({"oversized": true});
        }
        if hard_cut {
            metadata["hard_cut"] = json!(true);
        }

        let piece = SplitPiece {
            index: self.index,
            text: piece_text,
            metadata,
        };
        self.index += 1;

        let absolute_end = self.pos + end;
        if absolute_end >= self.text.len() {
            self.pos = self.text.len();
        } else {
            // Step back by the overlap, but always move forward.
            let back = back_by_chars(&self.text[..absolute_end], self.overlap);
            self.pos = if back > self.pos { back } else { absolute_end };
        }

        Some(piece)
    }
}

/// Byte offset of the `n`-th character, clamped to the end.
fn char_boundary(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}

/// Byte offset `n` characters before the end of `s`.
fn back_by_chars(s: &str, n: usize) -> usize {
    let mut offset = s.len();
    for _ in 0..n {
        match s[..offset].char_indices().last() {
            Some((i, _)) => offset = i,
            None => return 0,
        }
    }
    offset
}

/// The latest separator break inside the window, preferring larger
/// separators. The break lands after the separator so chunks keep their
/// trailing newline or space.
fn best_break(window: &str) -> Option<usize> {
    for separator in SEPARATORS {
        if let Some(at) = window.rfind(separator) {
            let end = at + separator.len();
            // A break at offset zero would make no progress.
            if end > 0 && end < window.len() {
                return Some(end);
            }
            if end == window.len() && at > 0 {
                return Some(at + separator.len());
            }
        }
    }
    None
}
