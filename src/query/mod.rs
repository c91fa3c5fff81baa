//! Agentic query pipeline.
//!
//! A query flows analyzer -> planner -> executor. The executor drives
//! tools (with the judge-backed retrieval loop inside the `rag` tool) and
//! ends in synthesis, evaluation, and bounded refinement. Every stage
//! leaves a typed record in the process log.

mod analyzer;
mod executor;
mod judge;
mod planner;
mod retrieval;
mod synthesis;

pub use analyzer::{classify_by_keywords, Complexity, QueryAnalysis, QueryAnalyzer};
pub use executor::{ExecutionOutcome, PlanExecutor};
pub use judge::{JudgeVerdict, RetrievalJudge};
pub use planner::{substitute_references, PlanStep, Planner, QueryPlan, StepType};
pub use retrieval::{RetrievalOutcome, RetrievedChunk, Retriever};
pub use synthesis::{CodeBlock, Draft, Evaluation, Evaluator, Refiner, Synthesizer};
