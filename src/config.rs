//! Engine configuration.
//!
//! One typed struct per concern, each with explicit defaults, validated
//! fail-fast at engine construction. No dynamic config maps.

use crate::chunking::StrategyKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Connection/resource pooling.
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Ingestion worker pool and queueing.
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// Chunking fallbacks when the judge is disabled or fails.
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// LLM judge toggles.
    #[serde(default)]
    pub judge: JudgeConfig,
    /// Retrieval loop limits.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Response evaluation and refinement gating.
    #[serde(default)]
    pub response: ResponseConfig,
    /// Timeouts.
    #[serde(default)]
    pub deadlines: DeadlineConfig,
    /// Model selection and LLM server location.
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Pool sizing and acquisition behavior for shared resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Handles per pool.
    pub pool_size: usize,
    /// How long `acquire` waits before failing with `ResourceExhausted`.
    pub acquire_timeout_ms: u64,
    /// Idle handles older than this are recycled on next acquire.
    pub idle_ttl_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            acquire_timeout_ms: 5_000,
            idle_ttl_ms: 300_000,
        }
    }
}

/// Ingestion parallelism and back-pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Concurrent document workers per job.
    pub worker_pool_size: usize,
    /// Bound on queued documents across running jobs.
    pub queue_bound: usize,
    /// When the queue is full: fail enqueue immediately instead of blocking.
    pub fail_fast_enqueue: bool,
    /// Minimum interval between persisted progress updates.
    pub progress_interval_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            queue_bound: 64,
            fail_fast_enqueue: false,
            progress_interval_ms: 250,
        }
    }
}

/// Fallback chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Strategy used when the judge is disabled or fails.
    pub default_strategy: StrategyKind,
    /// Target chunk size (chars, or tokens for the token strategy).
    pub chunk_size: usize,
    /// Overlap between consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::Recursive,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// LLM judge toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Consult the chunking judge during ingestion.
    pub chunking_enabled: bool,
    /// Consult the retrieval judge during the query loop.
    pub retrieval_enabled: bool,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            chunking_enabled: true,
            retrieval_enabled: true,
        }
    }
}

/// Retrieval loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum judge-driven retrieval iterations.
    pub max_iterations: u32,
    /// Final result cap.
    pub top_k: usize,
    /// Similarity floor below which chunks are discarded.
    pub relevance_floor: f64,
    /// Staleness window tolerated on the vector index after permission
    /// changes. The store-backed index is strongly consistent, so this is
    /// informational; the post-retrieval check runs regardless.
    pub refresh_interval_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            top_k: 5,
            relevance_floor: 0.4,
            refresh_interval_ms: 0,
        }
    }
}

/// Response evaluation and refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Run the evaluator/refiner loop at all.
    pub refinement_enabled: bool,
    /// Minimum overall evaluation score (1-10) to pass.
    pub quality_threshold: f64,
    /// Minimum hallucination score (1-10, higher = less hallucination).
    pub hallucination_threshold: f64,
    /// Maximum refinement passes after a failing evaluation.
    pub max_refinement_passes: u32,
    /// Hallucination score at or above which an answer with sources is
    /// reported as partially verified (fully verified at or above
    /// `hallucination_threshold`).
    pub verification_partial_floor: f64,
    /// Chat-history messages handed to a history-flagged synthesize step.
    pub history_window: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            refinement_enabled: true,
            quality_threshold: 7.0,
            hallucination_threshold: 8.0,
            max_refinement_passes: 1,
            verification_partial_floor: 5.0,
            history_window: 10,
        }
    }
}

/// Timeouts for queries and tool steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Whole-query deadline.
    pub query_ms: u64,
    /// Per-tool-invocation deadline, clamped to remaining query time.
    pub tool_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            query_ms: 60_000,
            tool_ms: 30_000,
        }
    }
}

/// Model selection and LLM server location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider label recorded in traces and errors.
    pub provider: String,
    /// Base URL of the LLM server.
    pub base_url: String,
    /// Generation model.
    pub model: String,
    /// Embedding model.
    pub embed_model: String,
    /// Request timeout.
    pub timeout_secs: u64,
    /// Max attempts on transient transport failures.
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration, failing fast on the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.resources.pool_size == 0 {
            return Err(Error::validation("resources.pool_size", "must be > 0"));
        }
        if self.ingestion.worker_pool_size == 0 {
            return Err(Error::validation(
                "ingestion.worker_pool_size",
                "must be > 0",
            ));
        }
        if self.ingestion.queue_bound == 0 {
            return Err(Error::validation("ingestion.queue_bound", "must be > 0"));
        }
        if self.chunking.chunk_size == 0 {
            return Err(Error::validation("chunking.chunk_size", "must be > 0"));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(Error::validation(
                "chunking.chunk_overlap",
                "must be smaller than chunk_size",
            ));
        }
        if self.retrieval.max_iterations == 0 {
            return Err(Error::validation("retrieval.max_iterations", "must be > 0"));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::validation("retrieval.top_k", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.retrieval.relevance_floor) {
            return Err(Error::validation(
                "retrieval.relevance_floor",
                "must be within [0, 1]",
            ));
        }
        for (field, value) in [
            ("response.quality_threshold", self.response.quality_threshold),
            (
                "response.hallucination_threshold",
                self.response.hallucination_threshold,
            ),
            (
                "response.verification_partial_floor",
                self.response.verification_partial_floor,
            ),
        ] {
            if !(1.0..=10.0).contains(&value) {
                return Err(Error::validation(field, "must be within [1, 10]"));
            }
        }
        if self.deadlines.query_ms == 0 || self.deadlines.tool_ms == 0 {
            return Err(Error::validation("deadlines", "timeouts must be > 0"));
        }
        if self.llm.base_url.is_empty() {
            return Err(Error::validation("llm.base_url", "must not be empty"));
        }
        if self.llm.model.is_empty() || self.llm.embed_model.is_empty() {
            return Err(Error::validation("llm.model", "model names must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let mut config = EngineConfig::default();
        config.chunking.chunk_size = 100;
        config.chunking.chunk_overlap = 100;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_relevance_floor_range() {
        let mut config = EngineConfig::default();
        config.retrieval.relevance_floor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = EngineConfig::default();
        config.ingestion.worker_pool_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker_pool_size"));
    }
}
