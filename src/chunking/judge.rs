//! Chunking judge.
//!
//! Samples a document (beginning, middle, end) and asks the LLM to pick a
//! strategy and parameters. Deterministic file-type overrides run before
//! the judge; parse failures fall back to the configured defaults. The
//! judge is advisory and never fails ingestion.

use serde_json::json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::StrategyKind;
use crate::config::ChunkingConfig;
use crate::llm::{parse_structured, GenerateRequest, LlmClient};

/// Sample budget handed to the judge.
const SAMPLE_BUDGET: usize = 5_000;

/// The judge's (or a fallback's) strategy choice for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingRecommendation {
    pub strategy: StrategyKind,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    /// True when the judge was skipped or its output was unusable.
    #[serde(default)]
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl ChunkingRecommendation {
    /// Defaults used when the judge is disabled or fails.
    pub fn fallback_from(config: &ChunkingConfig, reason: &str) -> Self {
        Self {
            strategy: config.default_strategy,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            justification: None,
            fallback: true,
            fallback_reason: Some(reason.to_string()),
        }
    }

    /// One-line summary for job records.
    pub fn summary(&self) -> String {
        format!(
            "{} ({}/{}){}",
            self.strategy,
            self.chunk_size,
            self.chunk_overlap,
            if self.fallback { " [fallback]" } else { "" }
        )
    }
}

/// LLM-backed strategy advisor.
pub struct ChunkingJudge {
    llm: Arc<dyn LlmClient>,
    defaults: ChunkingConfig,
}

impl ChunkingJudge {
    pub fn new(llm: Arc<dyn LlmClient>, defaults: ChunkingConfig) -> Self {
        Self { llm, defaults }
    }

    /// Deterministic per-file-type choices that pre-empt the judge.
    /// Structured and plain formats get enlarged recursive windows to keep
    /// rows and paragraphs whole.
    pub fn override_for(filename: &str) -> Option<ChunkingRecommendation> {
        let extension = filename.rsplit('.').next()?.to_ascii_lowercase();
        let (chunk_size, chunk_overlap, justification) = match extension.as_str() {
            "csv" | "tsv" => (1200, 100, "delimited rows split on enlarged windows"),
            "txt" => (800, 100, "plain text keeps paragraph context"),
            _ => return None,
        };
        Some(ChunkingRecommendation {
            strategy: StrategyKind::Recursive,
            chunk_size,
            chunk_overlap,
            justification: Some(justification.to_string()),
            fallback: false,
            fallback_reason: None,
        })
    }

    /// Pick a strategy for a document. File-type overrides win; otherwise
    /// the LLM is consulted and its answer validated.
    pub async fn recommend(&self, filename: &str, content: &str) -> ChunkingRecommendation {
        if let Some(preset) = Self::override_for(filename) {
            debug!(filename, strategy = %preset.strategy, "file-type override chose strategy");
            return preset;
        }

        let sample = sample_document(content, SAMPLE_BUDGET);
        let schema = json!({
            "type": "object",
            "required": ["strategy", "chunk_size", "chunk_overlap"],
            "properties": {
                "strategy": {"type": "string", "enum": ["recursive", "token", "markdown", "semantic"]},
                "chunk_size": {"type": "integer"},
                "chunk_overlap": {"type": "integer"},
                "justification": {"type": "string"}
            }
        });

        let request = GenerateRequest::new(format!(
            "Choose a chunking strategy for the document below.\n\
             Filename: {}\n\
             Strategies: recursive (general prose), token (token-budgeted), \
             markdown (header-structured), semantic (topic boundaries).\n\
             Respond with JSON: {{\"strategy\": ..., \"chunk_size\": n, \
             \"chunk_overlap\": n, \"justification\": \"...\"}}.\n\n\
             Sample:\n{}",
            filename, sample
        ))
        .with_system("You advise a document ingestion pipeline. Respond with JSON only.")
        .with_format(schema.clone());

        let response = match self.llm.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(filename, error = %e, "chunking judge LLM call failed");
                return ChunkingRecommendation::fallback_from(&self.defaults, "llm_error");
            }
        };

        let parsed = parse_structured(&response.text, &schema);
        let Some(value) = parsed.value else {
            warn!(filename, "chunking judge output unparseable");
            return ChunkingRecommendation::fallback_from(&self.defaults, "parse");
        };

        let strategy = value["strategy"]
            .as_str()
            .and_then(|s| s.parse::<StrategyKind>().ok());
        let chunk_size = value["chunk_size"].as_u64().map(|n| n as usize);
        let chunk_overlap = value["chunk_overlap"].as_u64().map(|n| n as usize);

        match (strategy, chunk_size, chunk_overlap) {
            (Some(strategy), Some(chunk_size), Some(chunk_overlap))
                if chunk_size > 0 && chunk_overlap < chunk_size =>
            {
                ChunkingRecommendation {
                    strategy,
                    chunk_size,
                    chunk_overlap,
                    justification: value["justification"].as_str().map(String::from),
                    fallback: false,
                    fallback_reason: None,
                }
            }
            _ => {
                warn!(filename, "chunking judge returned unusable parameters");
                ChunkingRecommendation::fallback_from(&self.defaults, "parse")
            }
        }
    }
}

/// Beginning, middle, and end of the document, within `budget` chars.
fn sample_document(content: &str, budget: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= budget {
        return content.to_string();
    }
    let window = budget / 3;
    let beginning: String = chars[..window].iter().collect();
    let middle_start = chars.len() / 2 - window / 2;
    let middle: String = chars[middle_start..middle_start + window].iter().collect();
    let end: String = chars[chars.len() - window..].iter().collect();
    format!("{}\n...\n{}\n...\n{}", beginning, middle, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;

    fn judge(responses: Vec<&str>) -> ChunkingJudge {
        ChunkingJudge::new(Arc::new(ScriptedLlm::new(responses)), ChunkingConfig::default())
    }

    #[tokio::test]
    async fn test_accepts_well_formed_recommendation() {
        let judge = judge(vec![
            r#"{"strategy": "markdown", "chunk_size": 800, "chunk_overlap": 80, "justification": "headers"}"#,
        ]);
        let rec = judge.recommend("specs.md", "# Hub\nmodel X-200\n").await;
        assert_eq!(rec.strategy, StrategyKind::Markdown);
        assert_eq!(rec.chunk_size, 800);
        assert!(!rec.fallback);
        assert_eq!(rec.justification.as_deref(), Some("headers"));
    }

    #[tokio::test]
    async fn test_malformed_json_falls_back_to_defaults() {
        let judge = judge(vec!["use markdown I guess?"]);
        let rec = judge.recommend("notes.md", "some text").await;
        assert_eq!(rec.strategy, StrategyKind::Recursive);
        assert_eq!(rec.chunk_size, 500);
        assert_eq!(rec.chunk_overlap, 50);
        assert!(rec.fallback);
        assert_eq!(rec.fallback_reason.as_deref(), Some("parse"));
    }

    #[tokio::test]
    async fn test_bad_parameters_fall_back() {
        let judge = judge(vec![
            r#"{"strategy": "recursive", "chunk_size": 100, "chunk_overlap": 100}"#,
        ]);
        let rec = judge.recommend("notes.md", "some text").await;
        assert!(rec.fallback);
    }

    #[tokio::test]
    async fn test_csv_override_preempts_judge() {
        // No scripted responses: reaching the LLM would error.
        let judge = judge(vec![]);
        let rec = judge.recommend("data.csv", "a,b,c\n1,2,3\n").await;
        assert_eq!(rec.strategy, StrategyKind::Recursive);
        assert_eq!(rec.chunk_size, 1200);
        assert!(!rec.fallback);
    }

    #[tokio::test]
    async fn test_txt_override() {
        let judge = judge(vec![]);
        let rec = judge.recommend("readme.txt", "plain text").await;
        assert_eq!(rec.chunk_size, 800);
    }

    #[test]
    fn test_sample_stays_within_budget() {
        let content = "abcdefghij".repeat(2_000);
        let sample = sample_document(&content, 5_000);
        assert!(sample.chars().count() <= 5_000 + 10);
        assert!(sample.contains("..."));
    }

    #[test]
    fn test_short_document_sampled_whole() {
        assert_eq!(sample_document("short", 5_000), "short");
    }

    #[test]
    fn test_summary_format() {
        let rec = ChunkingRecommendation::fallback_from(&ChunkingConfig::default(), "parse");
        assert_eq!(rec.summary(), "recursive (500/50) [fallback]");
    }
}
