//! RAG retrieval tool.
//!
//! Thin tool-contract wrapper around the judge-driven retrieval loop.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{Tool, ToolContext};
use crate::error::{Error, Result};
use crate::query::Retriever;

/// Retrieves permission-filtered context chunks for a query.
pub struct RagTool {
    retriever: Arc<Retriever>,
    default_top_k: usize,
}

impl RagTool {
    pub fn new(retriever: Arc<Retriever>, default_top_k: usize) -> Self {
        Self {
            retriever,
            default_top_k,
        }
    }
}

#[async_trait]
impl Tool for RagTool {
    fn name(&self) -> &'static str {
        "rag"
    }

    fn description(&self) -> &'static str {
        "Retrieves the most relevant document chunks the calling user may \
         read, iteratively refining the search."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {"type": "string"},
                "top_k": {"type": "integer"}
            }
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["chunks"],
            "properties": {
                "chunks": {"type": "array"},
                "iterations": {"type": "integer"},
                "queries": {"type": "array"}
            }
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value> {
        let query = input["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| Error::validation("query", "must be a non-empty string"))?;
        let top_k = input["top_k"].as_u64().map_or(self.default_top_k, |k| k as usize);

        let outcome = self
            .retriever
            .retrieve(&ctx.user, query, top_k, &ctx.history)
            .await?;

        let chunks: Vec<Value> = outcome
            .chunks
            .iter()
            .map(|chunk| {
                json!({
                    "chunk_id": chunk.chunk_id,
                    "document_id": chunk.document_id,
                    "index": chunk.index,
                    "filename": chunk.filename,
                    "content": chunk.content,
                    "score": chunk.score,
                    "document_created_at": chunk.document_created_at,
                })
            })
            .collect();

        Ok(json!({
            "chunks": chunks,
            "iterations": outcome.iterations,
            "queries": outcome.queries,
            "dropped_chunk_ids": outcome.dropped_chunk_ids,
            "judge_consulted": outcome.judge_consulted,
        }))
    }
}
