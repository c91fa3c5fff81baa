//! LLM client abstraction.
//!
//! A single trait covers one-shot generation, streaming, embeddings, and
//! model listing against an Ollama-protocol server. Schema-constrained
//! output goes through the layered format parser in [`format`], which
//! records which parser actually succeeded.

mod client;
pub mod format;
mod types;

pub use client::{ChunkStream, GatedClient, LlmClient, OllamaClient, RetryPolicy};
pub use format::{parse_structured, FormatOutcome, StructuredOutput};
pub use types::{
    EmbedRequest, EmbedResponse, GenerateRequest, GenerateResponse, ModelInfo, StreamChunk,
    TokenUsage,
};
