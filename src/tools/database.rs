//! Structured-data query tool.
//!
//! Answers questions about the caller's own corpus metadata: their
//! visible documents, job history, and analytics counters. Every read
//! goes through the caller's access predicate.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{Tool, ToolContext};
use crate::access::{AccessControl, PermissionLevel};
use crate::error::{Error, Result};
use crate::store::DocumentStore;

/// Metadata queries over the caller's reachable documents.
pub struct DatabaseTool {
    store: Arc<DocumentStore>,
    access: Arc<AccessControl>,
}

impl DatabaseTool {
    pub fn new(store: Arc<DocumentStore>, access: Arc<AccessControl>) -> Self {
        Self { store, access }
    }
}

#[async_trait]
impl Tool for DatabaseTool {
    fn name(&self) -> &'static str {
        "database"
    }

    fn description(&self) -> &'static str {
        "Queries structured corpus metadata: documents (with optional tag \
         filter) and analytics counters for the calling user."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["entity"],
            "properties": {
                "entity": {"type": "string", "enum": ["documents", "analytics"]},
                "tag": {"type": "string"},
                "limit": {"type": "integer"}
            }
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["rows"],
            "properties": {"rows": {"type": "array"}, "count": {"type": "integer"}}
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value> {
        let entity = input["entity"]
            .as_str()
            .ok_or_else(|| Error::validation("entity", "must be a string"))?;

        match entity {
            "documents" => {
                let predicate = self.access.filter_for(&ctx.user, PermissionLevel::Read);
                let mut documents = self.store.list_documents(&predicate).await?;
                if let Some(tag) = input["tag"].as_str() {
                    documents.retain(|d| d.tags.iter().any(|t| t == tag));
                }
                let limit = input["limit"].as_u64().unwrap_or(50) as usize;
                documents.truncate(limit);

                let rows: Vec<Value> = documents
                    .iter()
                    .map(|d| {
                        json!({
                            "id": d.id,
                            "filename": d.filename,
                            "folder": d.folder,
                            "tags": d.tags,
                            "visibility": d.visibility,
                            "status": d.status,
                            "created_at": d.created_at,
                        })
                    })
                    .collect();
                Ok(json!({"rows": rows, "count": rows.len()}))
            }
            "analytics" => {
                let metrics = self.store.metrics_for(ctx.user.user_id).await?;
                let rows: Vec<Value> = metrics
                    .iter()
                    .map(|(metric, value)| json!({"metric": metric, "value": value}))
                    .collect();
                Ok(json!({"rows": rows, "count": rows.len()}))
            }
            other => Err(Error::validation(
                "entity",
                format!("unknown entity '{}'", other),
            )),
        }
    }
}
