//! # quarry-core
//!
//! A security-aware retrieval-augmented generation engine: batched,
//! judge-driven document ingestion; an agentic query pipeline with
//! planning, tool dispatch, and iterative retrieval; per-user access
//! control pushed down into both the relational store and the vector
//! index; and a pooled async data plane shared by both paths.
//!
//! ## Core Components
//!
//! - **Engine**: the facade wiring everything together
//! - **IngestionPipeline**: batch jobs, chunking judge, embeddings
//! - **Retriever**: judge-refined, permission-filtered retrieval
//! - **PlanExecutor**: sequential plan steps ending in synthesis
//! - **ProcessLogger**: append-only traces sealed into audit reports
//!
//! ## Example
//!
//! ```rust,ignore
//! use quarry_core::{DocumentUpload, Engine, EngineConfig, QueryRequest, UserContext};
//!
//! let engine = Engine::open(EngineConfig::default(), "./data").await?;
//! let user = UserContext::new(user_id);
//!
//! let job = engine
//!     .submit(vec![DocumentUpload::new(user.user_id, "specs.md", bytes)], None)
//!     .await?;
//!
//! let response = engine
//!     .query(QueryRequest::new(user, "What is the hub model number?"))
//!     .await?;
//! println!("{} (report {})", response.answer, response.audit_report_id);
//! ```

pub mod access;
pub mod audit;
pub mod blobs;
pub mod chunking;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod llm;
pub mod query;
pub mod resources;
pub mod store;
pub mod tools;
pub mod vector;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
pub use access::{
    AccessControl, AccessPredicate, GranteeKind, PermissionLevel, UserContext, Visibility,
};
pub use audit::{
    AuditReport, HallucinationAssessment, ProcessLogger, SourceRef, StageKind, StageRecord,
    VerificationStatus,
};
pub use blobs::BlobStore;
pub use chunking::{
    ChunkingJudge, ChunkingRecommendation, MarkdownSplitter, RecursiveSplitter, SemanticSplitter,
    SplitPiece, Splitter, SplitterParams, StrategyKind, TokenSplitter,
};
pub use config::{
    ChunkingConfig, DeadlineConfig, EngineConfig, IngestionConfig, JudgeConfig, LlmConfig,
    ResourceConfig, ResponseConfig, RetrievalConfig,
};
pub use engine::{Engine, QueryRequest, QueryResponse};
pub use error::{Error, Result};
pub use ingestion::{DocumentUpload, IngestionPipeline, JobProgress};
pub use llm::{
    EmbedRequest, EmbedResponse, FormatOutcome, GenerateRequest, GenerateResponse, LlmClient,
    ModelInfo, OllamaClient, RetryPolicy, StreamChunk, StructuredOutput, TokenUsage,
};
pub use query::{
    Complexity, Draft, Evaluation, ExecutionOutcome, PlanExecutor, PlanStep, Planner,
    QueryAnalysis, QueryAnalyzer, QueryPlan, RetrievalJudge, RetrievalOutcome, RetrievedChunk,
    Retriever, StepType, Synthesizer,
};
pub use resources::{HealthStatus, Pool, PoolGuard, ResourceKind, ResourceManager};
pub use store::{
    Chunk, Citation, Conversation, Document, DocumentStage, DocumentStatus, DocumentStore,
    JobDocument, JobStatus, Message, MessageRole, NewChunk, NewDocument, PermissionGrant,
    ProcessingJob,
};
pub use tools::{CalculatorTool, DatabaseTool, RagTool, Tool, ToolContext, ToolRegistry};
pub use vector::{EmbeddingEnvelope, MetadataFilter, ScoredChunk, VectorIndex};
