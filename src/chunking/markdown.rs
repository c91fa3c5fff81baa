//! Header-structured splitter.
//!
//! Splits on the markdown header hierarchy (H1..H4) first, then applies
//! the recursive splitter inside each section. Each piece carries its
//! header path in metadata.

use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

use super::{RecursiveSplitter, SplitPiece, SplitStream, Splitter, SplitterParams};
use crate::error::Result;

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,4})\s+(.+)$").expect("static regex"));

/// Splitter honoring the document's header structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownSplitter;

impl MarkdownSplitter {
    pub fn new() -> Self {
        Self
    }
}

struct Section {
    /// Header titles from H1 down to this section's own header.
    path: Vec<String>,
    body: String,
}

fn sections(text: &str) -> Vec<Section> {
    let mut result = Vec::new();
    let mut path: Vec<(usize, String)> = Vec::new();
    let mut body_start = 0usize;

    let flush = |path: &[(usize, String)], body: &str, result: &mut Vec<Section>| {
        if !body.trim().is_empty() {
            result.push(Section {
                path: path.iter().map(|(_, t)| t.clone()).collect(),
                body: body.to_string(),
            });
        }
    };

    for captures in HEADER_RE.captures_iter(text) {
        let whole = captures.get(0).expect("match");
        flush(&path, &text[body_start..whole.start()], &mut result);

        let depth = captures[1].len();
        let title = captures[2].trim().to_string();
        path.retain(|(d, _)| *d < depth);
        path.push((depth, title));

        body_start = whole.end();
    }
    flush(&path, &text[body_start..], &mut result);
    result
}

impl Splitter for MarkdownSplitter {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn split(&self, text: String, params: &SplitterParams) -> Result<SplitStream> {
        params.validate()?;
        let inner = RecursiveSplitter::new();

        let mut pieces = Vec::new();
        let mut index = 0u32;
        for section in sections(&text) {
            let header_path = json!(section.path);
            for mut piece in inner.split(section.body, params)? {
                piece.index = index;
                piece.metadata["header_path"] = header_path.clone();
                index += 1;
                pieces.push(piece);
            }
        }

        Ok(Box::new(pieces.into_iter()))
    }
}
