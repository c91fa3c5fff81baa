//! Retrieval judge.
//!
//! Looks at a (query, retrieved chunks) pair and decides whether the
//! chunks answer the question: it can narrow to the relevant subset,
//! re-rank, refine the search query, and request another retrieval pass.
//! Advisory only; unusable output degrades to a neutral verdict.

use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::retrieval::RetrievedChunk;
use crate::llm::{parse_structured, GenerateRequest, LlmClient};

/// The judge's decision for one retrieval iteration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct JudgeVerdict {
    /// Chunk ids worth keeping; `None` keeps everything.
    pub relevant_chunks: Option<Vec<Uuid>>,
    /// Preferred ordering; `None` keeps score order.
    pub re_rank_chunks: Option<Vec<Uuid>>,
    /// Refined search query for the next pass.
    pub refined_query: Option<String>,
    /// Whether another retrieval pass is wanted.
    pub request_more: bool,
    /// Model's reasoning, for the trace.
    pub reasoning: Option<String>,
    /// True when the model's output was unusable and this verdict is the
    /// neutral default.
    pub fallback: bool,
}

impl JudgeVerdict {
    fn neutral() -> Self {
        Self {
            fallback: true,
            ..Self::default()
        }
    }
}

/// LLM-backed retrieval evaluator.
pub struct RetrievalJudge {
    llm: Arc<dyn LlmClient>,
}

impl RetrievalJudge {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn evaluate(
        &self,
        original_query: &str,
        chunks: &[RetrievedChunk],
        history: &[String],
    ) -> JudgeVerdict {
        let schema = json!({
            "type": "object",
            "required": ["request_more"],
            "properties": {
                "relevant_chunks": {"type": "array", "items": {"type": "string"}},
                "re_rank_chunks": {"type": "array", "items": {"type": "string"}},
                "refined_query": {"type": "string"},
                "request_more": {"type": "boolean"},
                "reasoning": {"type": "string"}
            }
        });

        let listing: String = chunks
            .iter()
            .map(|chunk| {
                format!(
                    "[{}] ({} #{}) {}\n",
                    chunk.chunk_id,
                    chunk.filename,
                    chunk.index,
                    truncate(&chunk.content, 400)
                )
            })
            .collect();
        let history_block = if history.is_empty() {
            String::new()
        } else {
            format!("Recent conversation:\n{}\n\n", history.join("\n"))
        };

        let request = GenerateRequest::new(format!(
            "Question: {}\n\n{}Retrieved chunks:\n{}\n\
             Judge whether these chunks answer the question. Respond with JSON: \
             {{\"relevant_chunks\": [ids], \"re_rank_chunks\": [ids], \
             \"refined_query\": \"...\", \"request_more\": bool, \"reasoning\": \"...\"}}. \
             Omit refined_query unless a different search phrasing would find \
             missing information.",
            original_query, history_block, listing
        ))
        .with_system("You evaluate retrieval quality for a question answering system. Respond with JSON only.")
        .with_format(schema.clone());

        let response = match self.llm.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "retrieval judge LLM call failed");
                return JudgeVerdict::neutral();
            }
        };

        let parsed = parse_structured(&response.text, &schema);
        let Some(value) = parsed.value else {
            warn!("retrieval judge output unparseable");
            return JudgeVerdict::neutral();
        };

        let ids = |key: &str| -> Option<Vec<Uuid>> {
            value[key].as_array().map(|array| {
                array
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| Uuid::parse_str(s).ok())
                    .collect()
            })
        };

        JudgeVerdict {
            relevant_chunks: ids("relevant_chunks"),
            re_rank_chunks: ids("re_rank_chunks"),
            refined_query: value["refined_query"]
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            request_more: value["request_more"].as_bool().unwrap_or(false),
            reasoning: value["reasoning"].as_str().map(String::from),
            fallback: false,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;

    fn chunk(content: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            index: 0,
            content: content.to_string(),
            filename: "a.md".to_string(),
            score: 0.8,
            document_created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_parses_full_verdict() {
        let keep = Uuid::new_v4();
        let response = format!(
            r#"{{"relevant_chunks": ["{}"], "request_more": true,
                "refined_query": "hub model number", "reasoning": "tangential"}}"#,
            keep
        );
        let judge = RetrievalJudge::new(Arc::new(ScriptedLlm::new(vec![&response])));
        let verdict = judge.evaluate("what is the hub?", &[chunk("something")], &[]).await;
        assert!(verdict.request_more);
        assert_eq!(verdict.refined_query.as_deref(), Some("hub model number"));
        assert_eq!(verdict.relevant_chunks.unwrap(), vec![keep]);
        assert!(!verdict.fallback);
    }

    #[tokio::test]
    async fn test_garbage_becomes_neutral_verdict() {
        let judge = RetrievalJudge::new(Arc::new(ScriptedLlm::new(vec!["looks fine to me"])));
        let verdict = judge.evaluate("q", &[chunk("c")], &[]).await;
        assert!(verdict.fallback);
        assert!(!verdict.request_more);
        assert!(verdict.relevant_chunks.is_none());
    }

    #[tokio::test]
    async fn test_blank_refined_query_is_dropped() {
        let judge = RetrievalJudge::new(Arc::new(ScriptedLlm::new(vec![
            r#"{"request_more": true, "refined_query": "  "}"#,
        ])));
        let verdict = judge.evaluate("q", &[], &[]).await;
        assert!(verdict.request_more);
        assert!(verdict.refined_query.is_none());
    }
}
