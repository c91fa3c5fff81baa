//! Response synthesis, evaluation, and refinement.
//!
//! The synthesizer composes an answer from labeled context and optional
//! chat history as a structured envelope (`text` plus `code_blocks`
//! referenced by `{CODE_BLOCK_n}` placeholders), degrading to plain text
//! on schema failure. The evaluator scores six axes; the refiner rewrites
//! failing drafts, bounded by configuration, and leaves passing drafts
//! untouched.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retrieval::RetrievedChunk;
use crate::config::ResponseConfig;
use crate::llm::{parse_structured, FormatOutcome, GenerateRequest, LlmClient};

/// One fenced code block of a structured answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: String,
    pub code: String,
}

/// A synthesized draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    /// Final text with `{CODE_BLOCK_n}` placeholders resolved.
    pub text: String,
    pub code_blocks: Vec<CodeBlock>,
    /// Which format parser produced the envelope.
    pub format_outcome: FormatOutcome,
}

/// Evaluation scores, 1-10 each; higher hallucination = better grounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub accuracy: f64,
    pub completeness: f64,
    pub relevance: f64,
    pub clarity: f64,
    pub coherence: f64,
    pub hallucination: f64,
    pub overall: f64,
    pub passed: bool,
    #[serde(default)]
    pub hallucinated_spans: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Composes answers from retrieved context.
pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn synthesize(
        &self,
        query: &str,
        context: &[RetrievedChunk],
        history: &[String],
        tool_notes: &[String],
    ) -> crate::error::Result<Draft> {
        let schema = json!({
            "type": "object",
            "required": ["text"],
            "properties": {
                "text": {"type": "string"},
                "code_blocks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["language", "code"],
                        "properties": {
                            "language": {"type": "string"},
                            "code": {"type": "string"}
                        }
                    }
                }
            }
        });

        let context_block: String = context
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                format!(
                    "[source {}: {} #{}]\n{}\n\n",
                    i + 1,
                    chunk.filename,
                    chunk.index,
                    chunk.content
                )
            })
            .collect();
        let history_block = if history.is_empty() {
            String::new()
        } else {
            format!("Conversation so far:\n{}\n\n", history.join("\n"))
        };
        let notes_block = if tool_notes.is_empty() {
            String::new()
        } else {
            format!("Tool results:\n{}\n\n", tool_notes.join("\n"))
        };

        let request = GenerateRequest::new(format!(
            "{}{}Context:\n{}Question: {}\n\n\
             Answer using only the context and tool results above. Cite no \
             sources that are not present. Respond with JSON: {{\"text\": \
             \"...\", \"code_blocks\": [{{\"language\": \"...\", \"code\": \
             \"...\"}}]}}. Reference code blocks in the text as \
             {{CODE_BLOCK_0}}, {{CODE_BLOCK_1}}, in order.",
            history_block, notes_block, context_block, query
        ))
        .with_system(
            "You answer questions from retrieved documents. If the context \
             is insufficient, say so plainly. Respond with JSON only.",
        )
        .with_format(schema.clone());

        let response = self.llm.generate(request).await?;
        let parsed = parse_structured(&response.text, &schema);

        let draft = match (&parsed.value, parsed.outcome) {
            (Some(value), outcome) => {
                let (text, code_blocks) = resolve_envelope(value);
                Draft {
                    text,
                    code_blocks,
                    format_outcome: outcome,
                }
            }
            (None, _) => {
                warn!("synthesis envelope unusable, falling back to plain text");
                Draft {
                    text: parsed.raw,
                    code_blocks: Vec::new(),
                    format_outcome: FormatOutcome::Raw,
                }
            }
        };
        debug!(outcome = %draft.format_outcome, chars = draft.text.len(), "draft synthesized");
        Ok(draft)
    }
}

/// Canonicalize the envelope: `text` + `code_blocks` is normative; a
/// legacy `text_blocks` array is accepted and folded into `text` first.
fn resolve_envelope(value: &serde_json::Value) -> (String, Vec<CodeBlock>) {
    let mut text = value["text"].as_str().unwrap_or_default().to_string();
    if text.is_empty() {
        if let Some(blocks) = value["text_blocks"].as_array() {
            text = blocks
                .iter()
                .filter_map(|b| b.as_str().or_else(|| b["text"].as_str()))
                .collect::<Vec<_>>()
                .join("\n");
        }
    }

    let code_blocks: Vec<CodeBlock> = value["code_blocks"]
        .as_array()
        .map(|array| {
            array
                .iter()
                .filter_map(|b| {
                    Some(CodeBlock {
                        language: b["language"].as_str()?.to_string(),
                        code: b["code"].as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    for (i, block) in code_blocks.iter().enumerate() {
        let placeholder = format!("{{CODE_BLOCK_{}}}", i);
        let rendered = format!("```{}\n{}\n```", block.language, block.code);
        text = text.replace(&placeholder, &rendered);
    }

    (text, code_blocks)
}

/// Scores drafts against the retrieved context.
pub struct Evaluator {
    llm: Arc<dyn LlmClient>,
    config: ResponseConfig,
}

impl Evaluator {
    pub fn new(llm: Arc<dyn LlmClient>, config: ResponseConfig) -> Self {
        Self { llm, config }
    }

    /// Score a draft. `None` when the evaluator's own output is unusable;
    /// the caller then reports verification as unknown.
    pub async fn evaluate(
        &self,
        query: &str,
        draft: &Draft,
        context: &[RetrievedChunk],
    ) -> Option<Evaluation> {
        let schema = json!({
            "type": "object",
            "required": ["accuracy", "completeness", "relevance", "clarity", "coherence", "hallucination"],
            "properties": {
                "accuracy": {"type": "number"},
                "completeness": {"type": "number"},
                "relevance": {"type": "number"},
                "clarity": {"type": "number"},
                "coherence": {"type": "number"},
                "hallucination": {"type": "number"},
                "hallucinated_spans": {"type": "array", "items": {"type": "string"}},
                "suggestions": {"type": "array", "items": {"type": "string"}}
            }
        });

        let context_block: String = context
            .iter()
            .map(|chunk| format!("- {}\n", chunk.content))
            .collect();
        let request = GenerateRequest::new(format!(
            "Question: {}\n\nContext:\n{}\nDraft answer:\n{}\n\n\
             Score the draft 1-10 on accuracy, completeness, relevance, \
             clarity, coherence, and hallucination (10 = fully grounded in \
             context, 1 = invented). List hallucinated spans and concrete \
             suggestions. Respond with JSON only.",
            query, context_block, draft.text
        ))
        .with_system("You are a strict response evaluator. Respond with JSON only.")
        .with_format(schema.clone());

        let response = match self.llm.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "evaluator LLM call failed");
                return None;
            }
        };
        let parsed = parse_structured(&response.text, &schema);
        let value = parsed.value?;

        let score = |key: &str| value[key].as_f64().unwrap_or(0.0).clamp(1.0, 10.0);
        let accuracy = score("accuracy");
        let completeness = score("completeness");
        let relevance = score("relevance");
        let clarity = score("clarity");
        let coherence = score("coherence");
        let hallucination = score("hallucination");
        let overall =
            (accuracy + completeness + relevance + clarity + coherence + hallucination) / 6.0;
        let passed = overall >= self.config.quality_threshold
            && hallucination >= self.config.hallucination_threshold;

        let strings = |key: &str| -> Vec<String> {
            value[key]
                .as_array()
                .map(|array| {
                    array
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        Some(Evaluation {
            accuracy,
            completeness,
            relevance,
            clarity,
            coherence,
            hallucination,
            overall,
            passed,
            hallucinated_spans: strings("hallucinated_spans"),
            suggestions: strings("suggestions"),
        })
    }
}

/// Rewrites failing drafts, constrained to the evaluator's findings.
pub struct Refiner {
    llm: Arc<dyn LlmClient>,
}

impl Refiner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Refine a failing draft once. A passing draft is returned unchanged.
    pub async fn refine(
        &self,
        query: &str,
        draft: Draft,
        evaluation: &Evaluation,
        context: &[RetrievedChunk],
    ) -> Draft {
        if evaluation.passed {
            return draft;
        }

        let context_block: String = context
            .iter()
            .map(|chunk| format!("- {}\n", chunk.content))
            .collect();
        let findings = format!(
            "Hallucinated spans: {:?}\nSuggestions: {:?}",
            evaluation.hallucinated_spans, evaluation.suggestions
        );

        let request = GenerateRequest::new(format!(
            "Question: {}\n\nContext:\n{}\nDraft:\n{}\n\nEvaluator findings:\n{}\n\n\
             Rewrite the draft fixing only the listed problems. Remove any \
             claim not supported by the context. Respond with the rewritten \
             answer as plain text.",
            query, context_block, draft.text, findings
        ))
        .with_system("You revise answers to remove unsupported claims.");

        match self.llm.generate(request).await {
            Ok(response) if !response.text.trim().is_empty() => {
                info!("draft refined after failing evaluation");
                Draft {
                    text: response.text,
                    code_blocks: draft.code_blocks,
                    format_outcome: draft.format_outcome,
                }
            }
            Ok(_) | Err(_) => {
                warn!("refinement failed, keeping original draft");
                draft
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use chrono::Utc;
    use uuid::Uuid;

    fn chunk(content: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            index: 0,
            content: content.to_string(),
            filename: "specs.md".to_string(),
            score: 0.9,
            document_created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_structured_synthesis_with_code_blocks() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"text": "Use this: {CODE_BLOCK_0}", "code_blocks": [{"language": "rust", "code": "fn main() {}"}]}"#,
        ]));
        let synthesizer = Synthesizer::new(llm);
        let draft = synthesizer
            .synthesize("how?", &[chunk("context")], &[], &[])
            .await
            .unwrap();
        assert_eq!(draft.format_outcome, FormatOutcome::Structured);
        assert!(draft.text.contains("```rust\nfn main() {}\n```"));
        assert_eq!(draft.code_blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_plain_text_fallback() {
        let llm = Arc::new(ScriptedLlm::new(vec!["Just a plain answer."]));
        let synthesizer = Synthesizer::new(llm);
        let draft = synthesizer.synthesize("q", &[], &[], &[]).await.unwrap();
        assert_eq!(draft.format_outcome, FormatOutcome::Raw);
        assert_eq!(draft.text, "Just a plain answer.");
    }

    #[tokio::test]
    async fn test_legacy_text_blocks_canonicalized() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"text": "", "text_blocks": ["part one", "part two"]}"#,
        ]));
        let synthesizer = Synthesizer::new(llm);
        let draft = synthesizer.synthesize("q", &[], &[], &[]).await.unwrap();
        assert_eq!(draft.text, "part one\npart two");
    }

    fn evaluator(responses: Vec<&str>) -> Evaluator {
        Evaluator::new(
            Arc::new(ScriptedLlm::new(responses)),
            ResponseConfig::default(),
        )
    }

    fn draft(text: &str) -> Draft {
        Draft {
            text: text.to_string(),
            code_blocks: vec![],
            format_outcome: FormatOutcome::Structured,
        }
    }

    #[tokio::test]
    async fn test_evaluation_passes_good_scores() {
        let evaluator = evaluator(vec![
            r#"{"accuracy": 9, "completeness": 8, "relevance": 9, "clarity": 9,
                "coherence": 9, "hallucination": 9}"#,
        ]);
        let evaluation = evaluator
            .evaluate("q", &draft("a"), &[chunk("c")])
            .await
            .unwrap();
        assert!(evaluation.passed);
        assert!(evaluation.overall >= 7.0);
    }

    #[tokio::test]
    async fn test_evaluation_fails_on_hallucination_floor() {
        // High overall but hallucination below the 8.0 threshold.
        let evaluator = evaluator(vec![
            r#"{"accuracy": 9, "completeness": 9, "relevance": 9, "clarity": 9,
                "coherence": 9, "hallucination": 5,
                "hallucinated_spans": ["the X-900 claim"]}"#,
        ]);
        let evaluation = evaluator
            .evaluate("q", &draft("a"), &[chunk("c")])
            .await
            .unwrap();
        assert!(!evaluation.passed);
        assert_eq!(evaluation.hallucinated_spans, vec!["the X-900 claim"]);
    }

    #[tokio::test]
    async fn test_unusable_evaluation_is_none() {
        let evaluator = evaluator(vec!["seems fine"]);
        assert!(evaluator.evaluate("q", &draft("a"), &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_refiner_is_noop_on_passing_draft() {
        // No scripted responses: any LLM call would error the test.
        let refiner = Refiner::new(Arc::new(ScriptedLlm::empty()));
        let evaluation = Evaluation {
            accuracy: 9.0,
            completeness: 9.0,
            relevance: 9.0,
            clarity: 9.0,
            coherence: 9.0,
            hallucination: 9.0,
            overall: 9.0,
            passed: true,
            hallucinated_spans: vec![],
            suggestions: vec![],
        };
        let original = draft("already good");
        let refined = refiner.refine("q", original.clone(), &evaluation, &[]).await;
        assert_eq!(refined.text, original.text);
    }

    #[tokio::test]
    async fn test_refiner_rewrites_failing_draft() {
        let refiner = Refiner::new(Arc::new(ScriptedLlm::new(vec!["corrected answer"])));
        let evaluation = Evaluation {
            accuracy: 4.0,
            completeness: 4.0,
            relevance: 4.0,
            clarity: 4.0,
            coherence: 4.0,
            hallucination: 3.0,
            overall: 3.8,
            passed: false,
            hallucinated_spans: vec!["bad claim".into()],
            suggestions: vec!["remove it".into()],
        };
        let refined = refiner
            .refine("q", draft("bad answer"), &evaluation, &[chunk("c")])
            .await;
        assert_eq!(refined.text, "corrected answer");
    }
}
