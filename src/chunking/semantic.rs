//! LLM-guided semantic splitter.
//!
//! Numbers the document's lines and asks the model for labeled line
//! ranges. Ranges must be ascending and non-overlapping; anything else
//! (including schema failure) falls back to the recursive splitter.
//! Output order is always the document's natural order.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{RecursiveSplitter, SplitPiece, SplitStream, Splitter, SplitterParams};
use crate::error::Result;
use crate::llm::{parse_structured, GenerateRequest, LlmClient};

const MAX_PROMPT_CHARS: usize = 24_000;

/// Splitter that delegates boundary selection to the LLM.
pub struct SemanticSplitter {
    llm: Arc<dyn LlmClient>,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    chunks: Vec<ChunkRange>,
}

#[derive(Debug, Deserialize)]
struct ChunkRange {
    start_line: usize,
    end_line: usize,
    #[serde(default)]
    label: Option<String>,
}

impl SemanticSplitter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn split(&self, text: String, params: &SplitterParams) -> Result<SplitStream> {
        params.validate()?;

        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() || text.len() > MAX_PROMPT_CHARS {
            return self.fall_back(text, params, "input unsuitable for semantic pass");
        }

        let numbered: String = lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>4} {}\n", i + 1, line))
            .collect();

        let schema = json!({
            "type": "object",
            "required": ["chunks"],
            "properties": {
                "chunks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["start_line", "end_line"],
                        "properties": {
                            "start_line": {"type": "integer"},
                            "end_line": {"type": "integer"},
                            "label": {"type": "string"}
                        }
                    }
                }
            }
        });

        let request = GenerateRequest::new(format!(
            "Partition this document into coherent chunks of roughly {} characters. \
             Respond with JSON: {{\"chunks\": [{{\"start_line\": n, \"end_line\": n, \"label\": \"...\"}}]}}. \
             Lines are 1-based and inclusive. Cover every line exactly once, in order.\n\n{}",
            params.chunk_size, numbered
        ))
        .with_system("You segment documents. Respond with JSON only.")
        .with_format(schema.clone());

        let response = match self.llm.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "semantic split LLM call failed");
                return self.fall_back(text, params, "llm error");
            }
        };

        let parsed = parse_structured(&response.text, &schema);
        let Some(value) = parsed.value else {
            return self.fall_back(text, params, "schema failure");
        };
        let ranges: RangeResponse = match serde_json::from_value(value) {
            Ok(ranges) => ranges,
            Err(_) => return self.fall_back(text, params, "schema failure"),
        };

        match pieces_from_ranges(&lines, &ranges.chunks) {
            Some(pieces) => {
                debug!(chunks = pieces.len(), "semantic split accepted");
                Ok(Box::new(pieces.into_iter()))
            }
            // Reordered or overlapping ranges are rejected wholesale.
            None => self.fall_back(text, params, "ranges out of order"),
        }
    }

    fn fall_back(
        &self,
        text: String,
        params: &SplitterParams,
        reason: &str,
    ) -> Result<SplitStream> {
        warn!(reason, "semantic split falling back to recursive");
        RecursiveSplitter::new().split(text, params)
    }
}

/// Build ordered pieces from 1-based inclusive line ranges. Returns `None`
/// when ranges regress, overlap, or run past the document.
fn pieces_from_ranges(lines: &[&str], ranges: &[ChunkRange]) -> Option<Vec<SplitPiece>> {
    if ranges.is_empty() {
        return None;
    }
    let mut pieces = Vec::with_capacity(ranges.len());
    let mut next_line = 1usize;
    for (index, range) in ranges.iter().enumerate() {
        if range.start_line < next_line
            || range.end_line < range.start_line
            || range.end_line > lines.len()
        {
            return None;
        }
        let text = lines[range.start_line - 1..range.end_line].join("\n");
        let mut piece = SplitPiece::new(index as u32, text);
        if let Some(label) = &range.label {
            piece.metadata = json!({"label": label});
        }
        pieces.push(piece);
        next_line = range.end_line + 1;
    }
    Some(pieces)
}
