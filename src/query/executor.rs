//! Plan executor.
//!
//! Runs plan steps strictly in order, substituting step references,
//! enforcing per-step deadlines, and writing a trace entry per step. Tool
//! failures stay confined to their step; the synthesizer is told about
//! them and works around them. A timed-out `rag` step contributes no
//! chunks but does not fail the query; a timed-out synthesize step does.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::planner::{substitute_references, QueryPlan, StepType};
use super::retrieval::RetrievedChunk;
use super::synthesis::{Draft, Evaluation, Evaluator, Refiner, Synthesizer};
use crate::access::UserContext;
use crate::audit::{ProcessLogger, SourceRef, StageKind, StageRecord};
use crate::config::{DeadlineConfig, ResponseConfig};
use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::store::Citation;
use crate::tools::{ToolContext, ToolRegistry};

/// Excerpt length used for citations and audit sources.
const EXCERPT_CHARS: usize = 200;

/// What execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub sources: Vec<SourceRef>,
    pub evaluation: Option<Evaluation>,
    pub refinement_passes: u32,
}

/// Sequential plan runner.
pub struct PlanExecutor {
    registry: Arc<ToolRegistry>,
    synthesizer: Synthesizer,
    evaluator: Evaluator,
    refiner: Refiner,
    response: ResponseConfig,
    deadlines: DeadlineConfig,
}

impl PlanExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        response: ResponseConfig,
        deadlines: DeadlineConfig,
    ) -> Self {
        Self {
            registry,
            synthesizer: Synthesizer::new(Arc::clone(&llm)),
            evaluator: Evaluator::new(Arc::clone(&llm), response.clone()),
            refiner: Refiner::new(llm),
            response,
            deadlines,
        }
    }

    pub async fn execute(
        &self,
        plan: &mut QueryPlan,
        user: &UserContext,
        history: &[String],
        deadline_ms: Option<u64>,
        logger: &mut ProcessLogger,
    ) -> Result<ExecutionOutcome> {
        let query_budget = Duration::from_millis(deadline_ms.unwrap_or(self.deadlines.query_ms));
        let deadline = Instant::now() + query_budget;
        let tool_budget = Duration::from_millis(self.deadlines.tool_ms);

        let mut context: Vec<RetrievedChunk> = Vec::new();
        let mut seen_chunks: HashSet<uuid::Uuid> = HashSet::new();
        let mut tool_notes: Vec<String> = Vec::new();
        let mut outcome: Option<ExecutionOutcome> = None;

        for warning in &plan.dropped_tools {
            logger.append(
                StageRecord::new(StageKind::Planning, format!("tool '{}' dropped", warning))
                    .with_detail("reason", json!("not permitted or not registered")),
            );
        }

        while plan.cursor < plan.steps.len() {
            let step = plan.steps[plan.cursor].clone();
            let remaining = deadline.saturating_duration_since(Instant::now());

            match step.step_type {
                StepType::Tool => {
                    let tool_name = step.tool.clone().unwrap_or_default();
                    let step_deadline = remaining.min(tool_budget);
                    let started = Instant::now();

                    let result = if step_deadline.is_zero() {
                        Err(Error::timeout(query_budget.as_millis() as u64))
                    } else {
                        let tool = self.registry.get(&tool_name);
                        match tool {
                            Ok(tool) => {
                                let input = substitute_references(&step.input, &plan.results);
                                let mut ctx = ToolContext::new(user.clone(), step_deadline);
                                ctx.history = history.to_vec();
                                match tokio::time::timeout(
                                    step_deadline,
                                    tool.execute(input, &ctx),
                                )
                                .await
                                {
                                    Ok(result) => result,
                                    Err(_) => {
                                        Err(Error::timeout(step_deadline.as_millis() as u64))
                                    }
                                }
                            }
                            Err(e) => Err(e),
                        }
                    };

                    let duration_ms = started.elapsed().as_millis() as u64;
                    match result {
                        Ok(output) => {
                            logger.append(
                                StageRecord::new(
                                    StageKind::ToolExecution,
                                    format!("step {}: {} succeeded", step.index, tool_name),
                                )
                                .with_detail("input", step.input.clone())
                                .with_detail("duration_ms", json!(duration_ms)),
                            );
                            if tool_name == "rag" {
                                collect_chunks(&output, &mut context, &mut seen_chunks);
                            } else {
                                tool_notes.push(format!(
                                    "{} returned: {}",
                                    tool_name,
                                    summarize(&output)
                                ));
                            }
                            plan.results[step.index] = Some(output);
                        }
                        Err(e) => {
                            // Confined to this step; the synthesizer is
                            // told and works around it.
                            warn!(step = step.index, tool = %tool_name, error = %e, "tool step failed");
                            logger.append(
                                StageRecord::new(
                                    StageKind::ToolExecution,
                                    format!("step {}: {} failed", step.index, tool_name),
                                )
                                .with_detail("input", step.input.clone())
                                .with_detail("error", json!(e.to_string()))
                                .with_detail("duration_ms", json!(duration_ms)),
                            );
                            tool_notes.push(format!(
                                "{} failed and its result is unavailable: {}",
                                tool_name, e
                            ));
                        }
                    }
                }
                StepType::Synthesize => {
                    if remaining.is_zero() {
                        return Err(Error::timeout(query_budget.as_millis() as u64));
                    }
                    let step_history: &[String] = if step.use_history { history } else { &[] };
                    let draft = tokio::time::timeout(
                        remaining,
                        self.synthesizer
                            .synthesize(&plan.query, &context, step_history, &tool_notes),
                    )
                    .await
                    .map_err(|_| Error::timeout(query_budget.as_millis() as u64))??;

                    logger.append(
                        StageRecord::new(StageKind::Synthesis, "draft composed")
                            .with_detail("format", json!(draft.format_outcome.to_string()))
                            .with_detail("context_chunks", json!(context.len())),
                    );

                    let finished = self.evaluate_and_refine(plan, &context, draft, logger).await;
                    plan.results[step.index] = Some(json!({"text": finished.0.text.clone()}));
                    outcome = Some(self.assemble(finished.0, finished.1, finished.2, &context));
                }
            }

            plan.cursor += 1;
        }

        plan.completed = true;
        outcome.ok_or_else(|| Error::Internal("plan had no synthesize step".into()))
    }

    /// Evaluate the draft and run bounded refinement passes.
    async fn evaluate_and_refine(
        &self,
        plan: &QueryPlan,
        context: &[RetrievedChunk],
        mut draft: Draft,
        logger: &mut ProcessLogger,
    ) -> (Draft, Option<Evaluation>, u32) {
        if !self.response.refinement_enabled {
            return (draft, None, 0);
        }

        let mut evaluation = self.evaluator.evaluate(&plan.query, &draft, context).await;
        if let Some(eval) = &evaluation {
            logger.append(
                StageRecord::new(
                    StageKind::Evaluation,
                    format!("overall {:.1}, hallucination {:.1}", eval.overall, eval.hallucination),
                )
                .with_detail("passed", json!(eval.passed)),
            );
        } else {
            logger.append(StageRecord::new(
                StageKind::Evaluation,
                "evaluator output unusable, skipping",
            ));
        }

        let mut passes = 0u32;
        while passes < self.response.max_refinement_passes {
            let Some(eval) = &evaluation else { break };
            if eval.passed {
                break;
            }
            draft = self.refiner.refine(&plan.query, draft, eval, context).await;
            passes += 1;
            evaluation = self.evaluator.evaluate(&plan.query, &draft, context).await;
            logger.append(
                StageRecord::new(StageKind::Refinement, format!("pass {}", passes)).with_detail(
                    "passed",
                    json!(evaluation.as_ref().map(|e| e.passed)),
                ),
            );
        }

        (draft, evaluation, passes)
    }

    fn assemble(
        &self,
        draft: Draft,
        evaluation: Option<Evaluation>,
        refinement_passes: u32,
        context: &[RetrievedChunk],
    ) -> ExecutionOutcome {
        let citations: Vec<Citation> = context
            .iter()
            .map(|chunk| Citation {
                document_id: chunk.document_id,
                chunk_id: chunk.chunk_id,
                filename: chunk.filename.clone(),
                excerpt: excerpt(&chunk.content),
            })
            .collect();
        let sources: Vec<SourceRef> = context
            .iter()
            .map(|chunk| SourceRef {
                document_id: chunk.document_id,
                chunk_id: chunk.chunk_id,
                filename: chunk.filename.clone(),
                excerpt: excerpt(&chunk.content),
                score: chunk.score,
            })
            .collect();

        ExecutionOutcome {
            answer: draft.text,
            citations,
            sources,
            evaluation,
            refinement_passes,
        }
    }
}

fn collect_chunks(
    output: &serde_json::Value,
    context: &mut Vec<RetrievedChunk>,
    seen: &mut HashSet<uuid::Uuid>,
) {
    let Some(chunks) = output["chunks"].as_array() else {
        return;
    };
    for value in chunks {
        match serde_json::from_value::<RetrievedChunk>(value.clone()) {
            Ok(chunk) => {
                if seen.insert(chunk.chunk_id) {
                    context.push(chunk);
                }
            }
            Err(e) => debug!(error = %e, "skipping malformed chunk in rag output"),
        }
    }
}

fn summarize(value: &serde_json::Value) -> String {
    let rendered = value.to_string();
    excerpt(&rendered)
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(EXCERPT_CHARS).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use crate::query::analyzer::QueryAnalysis;
    use crate::query::planner::Planner;
    use crate::query::Complexity;
    use crate::store::DocumentStore;
    use crate::testutil::memory_pool;
    use crate::tools::{CalculatorTool, Tool};
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    struct CannedRag {
        chunks: serde_json::Value,
    }

    #[async_trait]
    impl Tool for CannedRag {
        fn name(&self) -> &'static str {
            "rag"
        }

        fn description(&self) -> &'static str {
            "canned retrieval"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({})
        }

        fn output_schema(&self) -> serde_json::Value {
            json!({})
        }

        async fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value> {
            Ok(json!({"chunks": self.chunks}))
        }
    }

    struct SlowSynthLlm;

    #[async_trait]
    impl crate::llm::LlmClient for SlowSynthLlm {
        async fn generate(
            &self,
            _request: crate::llm::GenerateRequest,
        ) -> Result<crate::llm::GenerateResponse> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(crate::llm::GenerateResponse {
                text: "too late".into(),
                model: "slow".into(),
                usage: Default::default(),
            })
        }

        async fn generate_stream(
            &self,
            _request: crate::llm::GenerateRequest,
        ) -> Result<crate::llm::ChunkStream> {
            Err(Error::Internal("unused".into()))
        }

        async fn embed(
            &self,
            _request: crate::llm::EmbedRequest,
        ) -> Result<crate::llm::EmbedResponse> {
            Err(Error::Internal("unused".into()))
        }

        async fn list_models(&self) -> Result<Vec<crate::llm::ModelInfo>> {
            Ok(vec![])
        }

        fn provider(&self) -> &str {
            "slow"
        }
    }

    fn canned_chunk(content: &str) -> serde_json::Value {
        json!({
            "chunk_id": Uuid::new_v4(),
            "document_id": Uuid::new_v4(),
            "index": 0,
            "filename": "specs.md",
            "content": content,
            "score": 0.9,
            "document_created_at": Utc::now(),
        })
    }

    async fn logger() -> ProcessLogger {
        let store = Arc::new(DocumentStore::new(memory_pool("exec")));
        store.initialize().await.unwrap();
        ProcessLogger::start(store, Uuid::new_v4(), None).await.unwrap()
    }

    fn simple_plan(registry: &ToolRegistry, user: Uuid, query: &str) -> QueryPlan {
        let analysis = QueryAnalysis {
            complexity: Complexity::Simple,
            requires_tools: vec!["rag".into()],
            sub_queries: vec![],
            reasoning: None,
            fallback: true,
        };
        Planner::new(5).build(user, query, &analysis, registry, &["rag".to_string()])
    }

    #[tokio::test]
    async fn test_simple_plan_executes_and_cites() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CannedRag {
            chunks: json!([canned_chunk("the hub is model X-200")]),
        }));
        let registry = Arc::new(registry);

        // Responses: synthesize, evaluate.
        let llm: Arc<dyn crate::llm::LlmClient> = Arc::new(ScriptedLlm::new(vec![
            r#"{"text": "The hub model number is X-200."}"#,
            r#"{"accuracy": 9, "completeness": 9, "relevance": 9, "clarity": 9,
                "coherence": 9, "hallucination": 9}"#,
        ]));
        let executor = PlanExecutor::new(
            Arc::clone(&registry),
            llm,
            ResponseConfig::default(),
            DeadlineConfig::default(),
        );

        let user = UserContext::new(Uuid::new_v4());
        let mut plan = simple_plan(&registry, user.user_id, "what is the hub model number?");
        let mut logger = logger().await;
        let outcome = executor
            .execute(&mut plan, &user, &[], None, &mut logger)
            .await
            .unwrap();

        assert!(outcome.answer.contains("X-200"));
        assert_eq!(outcome.citations.len(), 1);
        assert_eq!(outcome.sources.len(), 1);
        assert!(!outcome.sources[0].excerpt.is_empty());
        assert!(outcome.evaluation.unwrap().passed);
        assert!(plan.completed);
    }

    #[tokio::test]
    async fn test_tool_failure_is_confined_and_synthesizer_informed() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CannedRag {
            chunks: json!([canned_chunk("relevant context")]),
        }));
        registry.register(Arc::new(CalculatorTool::new()));
        let registry = Arc::new(registry);

        let llm: Arc<dyn crate::llm::LlmClient> = Arc::new(ScriptedLlm::new(vec![
            r#"{"text": "The computation could not be completed; context says enough."}"#,
            r#"{"accuracy": 8, "completeness": 8, "relevance": 8, "clarity": 8,
                "coherence": 8, "hallucination": 9}"#,
        ]));
        let executor = PlanExecutor::new(
            Arc::clone(&registry),
            llm,
            ResponseConfig::default(),
            DeadlineConfig::default(),
        );

        let analysis = QueryAnalysis {
            complexity: Complexity::Complex,
            requires_tools: vec!["rag".into(), "calculator".into()],
            sub_queries: vec![],
            reasoning: None,
            fallback: true,
        };
        let user = UserContext::new(Uuid::new_v4());
        let mut plan = Planner::new(5).build(
            user.user_id,
            "what is elephant plus giraffe?",
            &analysis,
            &registry,
            &["rag".to_string(), "calculator".to_string()],
        );
        let mut logger = logger().await;
        let outcome = executor
            .execute(&mut plan, &user, &[], None, &mut logger)
            .await
            .unwrap();

        assert!(outcome.answer.contains("could not be completed"));
        // Trace shows the calculator failure and the rag success.
        let records = logger.records();
        assert!(records.iter().any(|r| r.content.contains("calculator failed")
            || r.content.contains("calculator") && r.content.contains("failed")));
        assert!(records.iter().any(|r| r.content.contains("rag succeeded")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesize_timeout_fails_query() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CannedRag {
            chunks: json!([canned_chunk("context")]),
        }));
        let registry = Arc::new(registry);

        let executor = PlanExecutor::new(
            Arc::clone(&registry),
            Arc::new(SlowSynthLlm),
            ResponseConfig::default(),
            DeadlineConfig::default(),
        );

        let user = UserContext::new(Uuid::new_v4());
        let mut plan = simple_plan(&registry, user.user_id, "anything");
        let mut logger = logger().await;
        let err = executor
            .execute(&mut plan, &user, &[], Some(2_000), &mut logger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_failed_refinement_keeps_going_until_budget() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CannedRag {
            chunks: json!([canned_chunk("grounding")]),
        }));
        let registry = Arc::new(registry);

        // synthesize, evaluate (fail), refine, re-evaluate (pass)
        let llm: Arc<dyn crate::llm::LlmClient> = Arc::new(ScriptedLlm::new(vec![
            r#"{"text": "draft with an invented spec number"}"#,
            r#"{"accuracy": 5, "completeness": 5, "relevance": 5, "clarity": 5,
                "coherence": 5, "hallucination": 3, "hallucinated_spans": ["invented spec"]}"#,
            "clean rewritten answer",
            r#"{"accuracy": 9, "completeness": 9, "relevance": 9, "clarity": 9,
                "coherence": 9, "hallucination": 9}"#,
        ]));
        let executor = PlanExecutor::new(
            Arc::clone(&registry),
            llm,
            ResponseConfig::default(),
            DeadlineConfig::default(),
        );

        let user = UserContext::new(Uuid::new_v4());
        let mut plan = simple_plan(&registry, user.user_id, "q");
        let mut logger = logger().await;
        let outcome = executor
            .execute(&mut plan, &user, &[], None, &mut logger)
            .await
            .unwrap();

        assert_eq!(outcome.refinement_passes, 1);
        assert_eq!(outcome.answer, "clean rewritten answer");
        assert!(outcome.evaluation.unwrap().passed);
    }
}
