//! Chunking strategies.
//!
//! Four splitters produce an ordered, finite sequence of (index, text)
//! pieces: recursive (separator ladder), token (caller-supplied
//! tokenizer), markdown (header hierarchy first), and semantic
//! (LLM-guided, falling back to recursive). Strategy selection is the
//! chunking judge's job; deterministic file-type overrides run first.

mod judge;
mod markdown;
mod recursive;
mod semantic;
mod token;

pub use judge::{ChunkingJudge, ChunkingRecommendation};
pub use markdown::MarkdownSplitter;
pub use recursive::RecursiveSplitter;
pub use semantic::SemanticSplitter;
pub use token::{Tokenizer, TokenSplitter, WhitespaceTokenizer};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::llm::LlmClient;

/// Available chunking strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Recursive,
    Token,
    Markdown,
    Semantic,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recursive => "recursive",
            Self::Token => "token",
            Self::Markdown => "markdown",
            Self::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recursive" => Ok(Self::Recursive),
            "token" => Ok(Self::Token),
            "markdown" => Ok(Self::Markdown),
            "semantic" => Ok(Self::Semantic),
            other => Err(Error::validation("strategy", format!("unknown value '{}'", other))),
        }
    }
}

/// Size and overlap parameters for a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitterParams {
    /// Target size in characters (tokens for the token strategy).
    pub chunk_size: usize,
    /// Overlap carried into the next chunk.
    pub chunk_overlap: usize,
}

impl SplitterParams {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::validation("chunk_size", "must be > 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::validation(
                "chunk_overlap",
                "must be smaller than chunk_size",
            ));
        }
        Ok(())
    }
}

/// One ordered output piece of a splitter.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPiece {
    /// 0-based dense ordinal.
    pub index: u32,
    /// Verbatim text span.
    pub text: String,
    /// Splitter metadata (header path, oversize marker).
    pub metadata: Value,
}

impl SplitPiece {
    pub fn new(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            metadata: Value::Object(Default::default()),
        }
    }
}

/// A finite, ordered, non-restartable sequence of pieces.
pub type SplitStream = Box<dyn Iterator<Item = SplitPiece> + Send>;

/// A deterministic splitter.
pub trait Splitter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Split `text` into ordered pieces. The stream owns its input.
    fn split(&self, text: String, params: &SplitterParams) -> Result<SplitStream>;
}

/// Run the chosen strategy over a document. The semantic strategy needs
/// the LLM and quietly degrades to recursive when the model's output is
/// unusable.
pub async fn run_strategy(
    strategy: StrategyKind,
    llm: &Arc<dyn LlmClient>,
    text: String,
    params: &SplitterParams,
) -> Result<SplitStream> {
    params.validate()?;
    match strategy {
        StrategyKind::Recursive => RecursiveSplitter::new().split(text, params),
        StrategyKind::Token => TokenSplitter::whitespace().split(text, params),
        StrategyKind::Markdown => MarkdownSplitter::new().split(text, params),
        StrategyKind::Semantic => {
            SemanticSplitter::new(Arc::clone(llm))
                .split(text, params)
                .await
        }
    }
}
