//! Persistent domain types: documents, chunks, permissions, conversations,
//! jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use crate::access::{GranteeKind, PermissionLevel, Visibility};
use crate::chunking::ChunkingRecommendation;
use crate::error::Error;

/// Document processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation("status", format!("unknown value '{}'", other))),
        }
    }
}

/// A stored document. Content bytes live in blob storage; the chunking
/// recommendation that produced its chunks is kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub folder: String,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub visibility: Visibility,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub chunking: Option<ChunkingRecommendation>,
    /// Optimistic concurrency version, bumped on every chunk replace.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for document creation.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: Uuid,
    pub filename: String,
    pub folder: String,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub visibility: Visibility,
}

impl NewDocument {
    pub fn new(owner_id: Uuid, filename: impl Into<String>) -> Self {
        Self {
            owner_id,
            filename: filename.into(),
            folder: "/".to_string(),
            tags: Vec::new(),
            metadata: Value::Object(Default::default()),
            visibility: Visibility::Private,
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// A contiguous text span of a document; the unit of retrieval and
/// embedding. Never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// 0-based dense ordinal within the document.
    pub index: u32,
    pub content: String,
    /// Splitter-supplied metadata (header path and the like) plus the
    /// ownership snapshot frozen at chunking time.
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Chunk content to persist; ids are derived deterministically.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub index: u32,
    pub content: String,
    pub metadata: Value,
}

/// One permission row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub document_id: Uuid,
    pub grantee: String,
    pub grantee_kind: GranteeKind,
    pub level: PermissionLevel,
    pub created_at: DateTime<Utc>,
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(Error::validation("role", format!("unknown value '{}'", other))),
        }
    }
}

/// A source citation attached to an answer or message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: Uuid,
    pub chunk_id: Uuid,
    pub filename: String,
    pub excerpt: String,
}

/// A conversation owned by exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub citations: Option<Vec<Citation>>,
    pub created_at: DateTime<Utc>,
}

/// Ingestion job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::validation("status", format!("unknown value '{}'", other))),
        }
    }
}

/// Per-document progression inside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    Queued,
    Sampling,
    Judging,
    Splitting,
    Embedding,
    Persisting,
    Done,
    Failed,
}

impl DocumentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sampling => "sampling",
            Self::Judging => "judging",
            Self::Splitting => "splitting",
            Self::Embedding => "embedding",
            Self::Persisting => "persisting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DocumentStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "queued" => Ok(Self::Queued),
            "sampling" => Ok(Self::Sampling),
            "judging" => Ok(Self::Judging),
            "splitting" => Ok(Self::Splitting),
            "embedding" => Ok(Self::Embedding),
            "persisting" => Ok(Self::Persisting),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation("stage", format!("unknown value '{}'", other))),
        }
    }
}

/// A batch ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: JobStatus,
    pub total: u32,
    pub processed: u32,
    pub strategy_summary: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-document status row of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    pub document_id: Uuid,
    pub stage: DocumentStage,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for s in ["pending", "processing", "complete", "failed"] {
            assert_eq!(s.parse::<DocumentStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
    }

    #[test]
    fn test_new_document_defaults() {
        let doc = NewDocument::new(Uuid::new_v4(), "a.md");
        assert_eq!(doc.folder, "/");
        assert_eq!(doc.visibility, Visibility::Private);
        assert!(doc.tags.is_empty());
    }
}
