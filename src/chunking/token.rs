//! Token-window splitter.
//!
//! Like the recursive splitter but sized in tokens, using a deterministic
//! tokenizer the caller supplies. Chunks are byte spans of the original
//! text covering whole tokens, so content stays verbatim.

use std::sync::Arc;

use super::{SplitPiece, SplitStream, Splitter, SplitterParams};
use crate::error::Result;

/// Deterministic tokenizer producing byte spans over the input.
pub trait Tokenizer: Send + Sync {
    /// Ordered, non-overlapping (start, end) byte spans of tokens.
    fn spans(&self, text: &str) -> Vec<(usize, usize)>;
}

/// Whitespace tokenizer; the default when the caller supplies nothing
/// more specific.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut start = None;
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                if let Some(s) = start.take() {
                    spans.push((s, i));
                }
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            spans.push((s, text.len()));
        }
        spans
    }
}

/// Splitter over token windows.
pub struct TokenSplitter {
    tokenizer: Arc<dyn Tokenizer>,
}

impl TokenSplitter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    pub fn whitespace() -> Self {
        Self::new(Arc::new(WhitespaceTokenizer))
    }
}

impl Splitter for TokenSplitter {
    fn name(&self) -> &'static str {
        "token"
    }

    fn split(&self, text: String, params: &SplitterParams) -> Result<SplitStream> {
        params.validate()?;
        let spans = self.tokenizer.spans(&text);
        let chunk_tokens = params.chunk_size;
        let step = chunk_tokens - params.chunk_overlap;

        let mut pieces = Vec::new();
        let mut index = 0u32;
        let mut start_token = 0usize;
        while start_token < spans.len() {
            let end_token = (start_token + chunk_tokens).min(spans.len());
            let byte_start = spans[start_token].0;
            let byte_end = spans[end_token - 1].1;
            pieces.push(SplitPiece::new(index, &text[byte_start..byte_end]));
            index += 1;
            if end_token == spans.len() {
                break;
            }
            start_token += step;
        }

        Ok(Box::new(pieces.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(text: &str, size: usize, overlap: usize) -> Vec<SplitPiece> {
        TokenSplitter::whitespace()
            .split(text.to_string(), &SplitterParams::new(size, overlap))
            .unwrap()
            .collect()
    }

    #[test]
    fn test_whitespace_spans() {
        let spans = WhitespaceTokenizer.spans("ab  cd\ne");
        assert_eq!(spans, vec![(0, 2), (4, 6), (7, 8)]);
    }

    #[test]
    fn test_window_of_tokens() {
        let text = "a b c d e f g";
        let pieces = split(text, 3, 0);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].text, "a b c");
        assert_eq!(pieces[1].text, "d e f");
        assert_eq!(pieces[2].text, "g");
    }

    #[test]
    fn test_overlap_in_tokens() {
        let text = "a b c d e";
        let pieces = split(text, 3, 1);
        assert_eq!(pieces[0].text, "a b c");
        assert_eq!(pieces[1].text, "c d e");
    }

    #[test]
    fn test_empty_text() {
        assert!(split("", 10, 2).is_empty());
        assert!(split("   \n\t ", 10, 2).is_empty());
    }

    #[test]
    fn test_single_short_document() {
        let pieces = split("only four small words", 500, 50);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].index, 0);
        assert_eq!(pieces[0].text, "only four small words");
    }
}
