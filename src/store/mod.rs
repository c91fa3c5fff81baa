//! Transactional document store over SQLite.
//!
//! Holds documents, chunks, permissions, conversations, jobs, process
//! logs, and analytics counters. All writes are single-statement or
//! transactional; chunk replacement for a document is atomic and guarded
//! by an optimistic version check. Document and chunk reads take the
//! caller's access predicate and push it down as a row-level filter.

mod schema;
mod types;

pub use schema::{initialize_schema, is_initialized, SCHEMA_VERSION};
pub use types::{
    Chunk, Citation, Conversation, Document, DocumentStage, DocumentStatus, JobDocument,
    JobStatus, Message, MessageRole, NewChunk, NewDocument, PermissionGrant, ProcessingJob,
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::access::{AccessPredicate, GranteeKind, PermissionLevel, Visibility};
use crate::chunking::ChunkingRecommendation;
use crate::error::{Error, Result};
use crate::resources::Pool;

/// Deterministic chunk id: hash of document id, ordinal, and content.
/// Re-running ingestion on unchanged input yields identical ids.
pub fn chunk_id_for(document_id: Uuid, index: u32, content: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_be_bytes());
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// A chunk joined with the document fields needed for citations and
/// tie-breaking.
#[derive(Debug, Clone)]
pub struct ChunkWithDocument {
    pub chunk: Chunk,
    pub filename: String,
    pub document_created_at: DateTime<Utc>,
}

/// Pooled SQLite-backed store.
pub struct DocumentStore {
    pool: Pool<Connection>,
}

impl DocumentStore {
    pub fn new(pool: Pool<Connection>) -> Self {
        Self { pool }
    }

    /// Apply the schema. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let conn = self.pool.acquire().await?;
        initialize_schema(&conn)?;
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.pool.acquire().await?;
        f(&conn)
    }

    async fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.pool.acquire().await?;
        f(&mut conn)
    }

    // ==================== Documents ====================

    /// Create a document in `pending` status.
    pub async fn create_document(&self, new: NewDocument) -> Result<Document> {
        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            filename: new.filename,
            folder: new.folder,
            tags: new.tags,
            metadata: new.metadata,
            visibility: new.visibility,
            status: DocumentStatus::Pending,
            error: None,
            chunking: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let row = document.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (id, owner_id, filename, folder, tags, metadata,
                     visibility, status, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    row.id.to_string(),
                    row.owner_id.to_string(),
                    row.filename,
                    row.folder,
                    serde_json::to_string(&row.tags)?,
                    serde_json::to_string(&row.metadata)?,
                    row.visibility.as_str(),
                    row.status.as_str(),
                    row.version,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;

        Ok(document)
    }

    /// Fetch a document the caller is allowed to see. Invisible documents
    /// are indistinguishable from absent ones here; administrators go
    /// through [`DocumentStore::get_document_unchecked`].
    pub async fn get_document(
        &self,
        id: Uuid,
        predicate: &AccessPredicate,
    ) -> Result<Document> {
        let (filter_sql, filter_params) = predicate.sql();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM documents d WHERE d.id = ? AND {}",
                DOCUMENT_COLUMNS, filter_sql
            );
            let mut all_params: Vec<Box<dyn rusqlite::ToSql + Send>> =
                vec![Box::new(id.to_string())];
            all_params.extend(filter_params);

            let document = conn
                .query_row(
                    &sql,
                    rusqlite::params_from_iter(all_params.iter().map(|p| p.as_ref())),
                    map_document_row,
                )
                .optional()?;
            document
                .ok_or_else(|| Error::not_found("document", id.to_string()))
                .and_then(row_to_document)
        })
        .await
    }

    /// Fetch without access filtering. For internal paths that already
    /// hold an authorization decision.
    pub async fn get_document_unchecked(&self, id: Uuid) -> Result<Document> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM documents d WHERE d.id = ?", DOCUMENT_COLUMNS);
            let document = conn
                .query_row(&sql, params![id.to_string()], map_document_row)
                .optional()?;
            document
                .ok_or_else(|| Error::not_found("document", id.to_string()))
                .and_then(row_to_document)
        })
        .await
    }

    /// Whether the document exists at all, regardless of visibility.
    pub async fn document_exists(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM documents WHERE id = ?1",
                    params![id.to_string()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
        .await
    }

    /// Whether the document exists and passes the predicate. `NotFound`
    /// when it does not exist.
    pub async fn document_passes(
        &self,
        id: Uuid,
        predicate: &AccessPredicate,
    ) -> Result<bool> {
        if !self.document_exists(id).await? {
            return Err(Error::not_found("document", id.to_string()));
        }
        let (filter_sql, filter_params) = predicate.sql();
        self.with_conn(move |conn| {
            let sql = format!("SELECT 1 FROM documents d WHERE d.id = ? AND {}", filter_sql);
            let mut all_params: Vec<Box<dyn rusqlite::ToSql + Send>> =
                vec![Box::new(id.to_string())];
            all_params.extend(filter_params);
            Ok(conn
                .query_row(
                    &sql,
                    rusqlite::params_from_iter(all_params.iter().map(|p| p.as_ref())),
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
        .await
    }

    /// List documents visible to the caller, newest first.
    pub async fn list_documents(&self, predicate: &AccessPredicate) -> Result<Vec<Document>> {
        let (filter_sql, filter_params) = predicate.sql();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM documents d WHERE {} ORDER BY d.created_at DESC",
                DOCUMENT_COLUMNS, filter_sql
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(filter_params.iter().map(|p| p.as_ref())),
                map_document_row,
            )?;
            rows.map(|r| r.map_err(Error::from).and_then(row_to_document))
                .collect()
        })
        .await
    }

    /// Update processing status and error.
    pub async fn set_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let error = error.map(String::from);
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE documents SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    id.to_string(),
                    status.as_str(),
                    error,
                    Utc::now().to_rfc3339()
                ],
            )?;
            if updated == 0 {
                return Err(Error::not_found("document", id.to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Record the chunking recommendation that produced the chunks.
    pub async fn set_document_chunking(
        &self,
        id: Uuid,
        recommendation: &ChunkingRecommendation,
    ) -> Result<()> {
        let chunking = serde_json::to_string(recommendation)?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE documents SET chunking = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), chunking, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                return Err(Error::not_found("document", id.to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Change visibility. Permission re-tagging is the caller's job.
    pub async fn set_visibility(&self, id: Uuid, visibility: Visibility) -> Result<()> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE documents SET visibility = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    visibility.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            if updated == 0 {
                return Err(Error::not_found("document", id.to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Delete a document; chunks and permission rows cascade.
    pub async fn delete_document(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM documents WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    // ==================== Chunks ====================

    /// Atomically replace a document's chunks: optimistic version check,
    /// delete, ordered bulk insert, version bump, all in one transaction.
    ///
    /// Indices must form the dense range [0, N). Returns the new version.
    pub async fn replace_chunks(
        &self,
        document_id: Uuid,
        expected_version: i64,
        chunks: &[NewChunk],
    ) -> Result<i64> {
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.index as usize != i {
                return Err(Error::validation(
                    "chunks",
                    format!("indices must be dense, got {} at position {}", chunk.index, i),
                ));
            }
        }

        let chunks = chunks.to_vec();
        self.with_conn_mut(move |conn| {
            let tx = conn.transaction()?;

            let version: Option<i64> = tx
                .query_row(
                    "SELECT version FROM documents WHERE id = ?1",
                    params![document_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let version =
                version.ok_or_else(|| Error::not_found("document", document_id.to_string()))?;
            if version != expected_version {
                return Err(Error::VersionConflict {
                    document_id: document_id.to_string(),
                });
            }

            tx.execute(
                "DELETE FROM chunks WHERE document_id = ?1",
                params![document_id.to_string()],
            )?;

            let now = Utc::now().to_rfc3339();
            for chunk in &chunks {
                tx.execute(
                    "INSERT INTO chunks (id, document_id, chunk_index, content, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        chunk_id_for(document_id, chunk.index, &chunk.content).to_string(),
                        document_id.to_string(),
                        chunk.index,
                        chunk.content,
                        serde_json::to_string(&chunk.metadata)?,
                        now,
                    ],
                )?;
            }

            let new_version = version + 1;
            tx.execute(
                "UPDATE documents SET version = ?2, updated_at = ?3 WHERE id = ?1",
                params![document_id.to_string(), new_version, now],
            )?;

            tx.commit()?;
            Ok(new_version)
        })
        .await
    }

    /// All chunks of a document, in index order.
    pub async fn chunks_for(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, document_id, chunk_index, content, metadata, created_at
                 FROM chunks WHERE document_id = ?1 ORDER BY chunk_index",
            )?;
            let rows = stmt.query_map(params![document_id.to_string()], map_chunk_row)?;
            rows.map(|r| r.map_err(Error::from).and_then(row_to_chunk))
                .collect()
        })
        .await
    }

    /// Chunks by id, joined with document fields, in no particular order.
    pub async fn chunks_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ChunkWithDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!(
                "SELECT c.id, c.document_id, c.chunk_index, c.content, c.metadata, c.created_at,
                        d.filename, d.created_at
                 FROM chunks c JOIN documents d ON d.id = c.document_id
                 WHERE c.id IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(ids.iter()),
                |row| {
                    Ok((
                        map_chunk_row(row)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )?;
            rows.map(|r| {
                let (chunk_row, filename, doc_created) = r?;
                Ok(ChunkWithDocument {
                    chunk: row_to_chunk(chunk_row)?,
                    filename,
                    document_created_at: parse_timestamp(&doc_created)?,
                })
            })
            .collect()
        })
        .await
    }

    // ==================== Permissions ====================

    /// Insert or raise a grant. The stored level is replaced, not maxed;
    /// effective level computation folds in owner and public reach.
    pub async fn upsert_permission(
        &self,
        document_id: Uuid,
        grantee: &str,
        kind: GranteeKind,
        level: PermissionLevel,
    ) -> Result<()> {
        let grantee = grantee.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO document_permissions (document_id, grantee, grantee_kind, level, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(document_id, grantee, grantee_kind)
                 DO UPDATE SET level = excluded.level",
                params![
                    document_id.to_string(),
                    grantee,
                    kind.as_str(),
                    level.as_i64(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Remove a grant.
    pub async fn delete_permission(
        &self,
        document_id: Uuid,
        grantee: &str,
        kind: GranteeKind,
    ) -> Result<bool> {
        let grantee = grantee.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM document_permissions
                 WHERE document_id = ?1 AND grantee = ?2 AND grantee_kind = ?3",
                params![document_id.to_string(), grantee, kind.as_str()],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    /// All grants on a document.
    pub async fn permissions_for(&self, document_id: Uuid) -> Result<Vec<PermissionGrant>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT document_id, grantee, grantee_kind, level, created_at
                 FROM document_permissions WHERE document_id = ?1",
            )?;
            let rows = stmt.query_map(params![document_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            rows.map(|r| {
                let (document_id, grantee, kind, level, created_at) = r?;
                Ok(PermissionGrant {
                    document_id: parse_uuid(&document_id, "document_id")?,
                    grantee,
                    grantee_kind: GranteeKind::from_str(&kind)?,
                    level: PermissionLevel::from_i64(level)?,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
        })
        .await
    }

    // ==================== Conversations ====================

    pub async fn create_conversation(&self, owner_id: Uuid) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            owner_id,
            created_at: now,
            updated_at: now,
        };
        let row = conversation.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, owner_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.id.to_string(),
                    row.owner_id.to_string(),
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, owner_id, created_at, updated_at FROM conversations WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            let (id, owner_id, created_at, updated_at) =
                row.ok_or_else(|| Error::not_found("conversation", id.to_string()))?;
            Ok(Conversation {
                id: parse_uuid(&id, "id")?,
                owner_id: parse_uuid(&owner_id, "owner_id")?,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            })
        })
        .await
    }

    /// Append a message and touch the conversation.
    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        citations: Option<&[Citation]>,
    ) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content: content.to_string(),
            citations: citations.map(<[Citation]>::to_vec),
            created_at: now,
        };
        let row = message.clone();
        self.with_conn_mut(move |conn| {
            let tx = conn.transaction()?;
            let citations_json = row
                .citations
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, role, content, citations, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id.to_string(),
                    row.conversation_id.to_string(),
                    row.role.as_str(),
                    row.content,
                    citations_json,
                    row.created_at.to_rfc3339(),
                ],
            )?;
            let touched = tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![row.conversation_id.to_string(), row.created_at.to_rfc3339()],
            )?;
            if touched == 0 {
                return Err(Error::not_found(
                    "conversation",
                    row.conversation_id.to_string(),
                ));
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(message)
    }

    /// The most recent `limit` messages, oldest first.
    pub async fn history(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, citations, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![conversation_id.to_string(), limit as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )?;
            let mut messages: Vec<Message> = rows
                .map(|r| {
                    let (id, conversation_id, role, content, citations, created_at) = r?;
                    Ok(Message {
                        id: parse_uuid(&id, "id")?,
                        conversation_id: parse_uuid(&conversation_id, "conversation_id")?,
                        role: MessageRole::from_str(&role)?,
                        content,
                        citations: citations
                            .map(|c| serde_json::from_str(&c))
                            .transpose()?,
                        created_at: parse_timestamp(&created_at)?,
                    })
                })
                .collect::<Result<_>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    // ==================== Processing jobs ====================

    pub async fn create_job(
        &self,
        owner_id: Uuid,
        total: u32,
        idempotency_key: Option<&str>,
    ) -> Result<ProcessingJob> {
        let now = Utc::now();
        let job = ProcessingJob {
            id: Uuid::new_v4(),
            owner_id,
            status: JobStatus::Pending,
            total,
            processed: 0,
            strategy_summary: None,
            idempotency_key: idempotency_key.map(String::from),
            created_at: now,
            updated_at: now,
        };
        let row = job.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO processing_jobs (id, owner_id, status, total, processed,
                     idempotency_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.id.to_string(),
                    row.owner_id.to_string(),
                    row.status.as_str(),
                    row.total,
                    row.processed,
                    row.idempotency_key,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(job)
    }

    /// A prior job submitted with the same idempotency key, if any.
    pub async fn find_job_by_key(
        &self,
        owner_id: Uuid,
        key: &str,
    ) -> Result<Option<ProcessingJob>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM processing_jobs WHERE owner_id = ?1 AND idempotency_key = ?2",
                JOB_COLUMNS
            );
            conn.query_row(
                &sql,
                params![owner_id.to_string(), key],
                map_job_row,
            )
            .optional()?
            .map(row_to_job)
            .transpose()
        })
        .await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<ProcessingJob> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM processing_jobs WHERE id = ?1", JOB_COLUMNS);
            conn.query_row(&sql, params![id.to_string()], map_job_row)
                .optional()?
                .ok_or_else(|| Error::not_found("job", id.to_string()))
                .and_then(row_to_job)
        })
        .await
    }

    pub async fn set_job_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE processing_jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.as_str(), Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                return Err(Error::not_found("job", id.to_string()));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_job_progress(&self, id: Uuid, processed: u32) -> Result<()> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE processing_jobs SET processed = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), processed, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                return Err(Error::not_found("job", id.to_string()));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_job_strategy_summary(&self, id: Uuid, summary: &str) -> Result<()> {
        let summary = summary.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE processing_jobs SET strategy_summary = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), summary, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Record or advance one document's stage within a job.
    pub async fn upsert_job_document(
        &self,
        job_id: Uuid,
        document_id: Uuid,
        stage: DocumentStage,
        error: Option<&str>,
    ) -> Result<()> {
        let error = error.map(String::from);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO job_documents (job_id, document_id, status, error)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(job_id, document_id)
                 DO UPDATE SET status = excluded.status, error = excluded.error",
                params![
                    job_id.to_string(),
                    document_id.to_string(),
                    stage.as_str(),
                    error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Per-document statuses of a job.
    pub async fn job_documents(&self, job_id: Uuid) -> Result<Vec<JobDocument>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT document_id, status, error FROM job_documents
                 WHERE job_id = ?1 ORDER BY document_id",
            )?;
            let rows = stmt.query_map(params![job_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            rows.map(|r| {
                let (document_id, stage, error) = r?;
                Ok(JobDocument {
                    document_id: parse_uuid(&document_id, "document_id")?,
                    stage: DocumentStage::from_str(&stage)?,
                    error,
                })
            })
            .collect()
        })
        .await
    }

    // ==================== Process logs ====================

    /// Create an empty, unsealed process log.
    pub async fn create_process_log(
        &self,
        id: Uuid,
        owner_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO process_logs (id, owner_id, conversation_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    owner_id.to_string(),
                    conversation_id.map(|c| c.to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Replace the record array of an unsealed log.
    pub async fn update_process_log(&self, id: Uuid, records: &Value) -> Result<()> {
        let records = serde_json::to_string(records)?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE process_logs SET records = ?2 WHERE id = ?1 AND sealed = 0",
                params![id.to_string(), records],
            )?;
            if updated == 0 {
                return Err(Error::store(format!(
                    "process log {} is sealed or missing",
                    id
                )));
            }
            Ok(())
        })
        .await
    }

    /// Seal a log with its final report. Sealed logs are immutable;
    /// sealing twice is an error.
    pub async fn seal_process_log(&self, id: Uuid, records: &Value, report: &Value) -> Result<()> {
        let records = serde_json::to_string(records)?;
        let report = serde_json::to_string(report)?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE process_logs SET records = ?2, report = ?3, sealed = 1, sealed_at = ?4
                 WHERE id = ?1 AND sealed = 0",
                params![id.to_string(), records, report, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                return Err(Error::store(format!(
                    "process log {} is already sealed or missing",
                    id
                )));
            }
            Ok(())
        })
        .await
    }

    /// The sealed report for an audit-report id, owner-scoped.
    pub async fn get_report(&self, id: Uuid, owner_id: Uuid) -> Result<Value> {
        self.with_conn(move |conn| {
            let report: Option<Option<String>> = conn
                .query_row(
                    "SELECT report FROM process_logs WHERE id = ?1 AND owner_id = ?2 AND sealed = 1",
                    params![id.to_string(), owner_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let report = report
                .flatten()
                .ok_or_else(|| Error::not_found("audit report", id.to_string()))?;
            Ok(serde_json::from_str(&report)?)
        })
        .await
    }

    /// The full record array of a log, owner-scoped.
    pub async fn get_process_log(&self, id: Uuid, owner_id: Uuid) -> Result<Value> {
        self.with_conn(move |conn| {
            let records: Option<String> = conn
                .query_row(
                    "SELECT records FROM process_logs WHERE id = ?1 AND owner_id = ?2",
                    params![id.to_string(), owner_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let records =
                records.ok_or_else(|| Error::not_found("process log", id.to_string()))?;
            Ok(serde_json::from_str(&records)?)
        })
        .await
    }

    // ==================== Analytics ====================

    pub async fn bump_metric(&self, owner_id: Uuid, metric: &str, delta: i64) -> Result<()> {
        let metric = metric.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO analytics (owner_id, metric, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(owner_id, metric) DO UPDATE SET value = value + excluded.value",
                params![owner_id.to_string(), metric, delta],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn metrics_for(&self, owner_id: Uuid) -> Result<HashMap<String, i64>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT metric, value FROM analytics WHERE owner_id = ?1")?;
            let rows = stmt.query_map(params![owner_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.map(|r| r.map_err(Error::from)).collect()
        })
        .await
    }
}

// ==================== Row mapping ====================

const DOCUMENT_COLUMNS: &str = "d.id, d.owner_id, d.filename, d.folder, d.tags, d.metadata, \
     d.visibility, d.status, d.error, d.chunking, d.version, d.created_at, d.updated_at";

const JOB_COLUMNS: &str =
    "id, owner_id, status, total, processed, strategy_summary, idempotency_key, created_at, updated_at";

type DocumentRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    String,
    String,
);

fn map_document_row(row: &Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn row_to_document(row: DocumentRow) -> Result<Document> {
    let (
        id,
        owner_id,
        filename,
        folder,
        tags,
        metadata,
        visibility,
        status,
        error,
        chunking,
        version,
        created_at,
        updated_at,
    ) = row;
    Ok(Document {
        id: parse_uuid(&id, "id")?,
        owner_id: parse_uuid(&owner_id, "owner_id")?,
        filename,
        folder,
        tags: serde_json::from_str(&tags)?,
        metadata: serde_json::from_str(&metadata)?,
        visibility: visibility.parse()?,
        status: status.parse()?,
        error,
        chunking: chunking.map(|c| serde_json::from_str(&c)).transpose()?,
        version,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

type ChunkRow = (String, String, i64, String, String, String);

fn map_chunk_row(row: &Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn row_to_chunk(row: ChunkRow) -> Result<Chunk> {
    let (id, document_id, index, content, metadata, created_at) = row;
    Ok(Chunk {
        id: parse_uuid(&id, "id")?,
        document_id: parse_uuid(&document_id, "document_id")?,
        index: index as u32,
        content,
        metadata: serde_json::from_str(&metadata)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

type JobRow = (
    String,
    String,
    String,
    u32,
    u32,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn row_to_job(row: JobRow) -> Result<ProcessingJob> {
    let (
        id,
        owner_id,
        status,
        total,
        processed,
        strategy_summary,
        idempotency_key,
        created_at,
        updated_at,
    ) = row;
    Ok(ProcessingJob {
        id: parse_uuid(&id, "id")?,
        owner_id: parse_uuid(&owner_id, "owner_id")?,
        status: status.parse()?,
        total,
        processed,
        strategy_summary,
        idempotency_key,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::store(format!("bad uuid in {}: {}", field, e)))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|n| DateTime::from_naive_utc_and_offset(n, Utc))
        })
        .map_err(|e| Error::store(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_pool;
    use serde_json::json;

    async fn store() -> DocumentStore {
        let store = DocumentStore::new(memory_pool("store"));
        store.initialize().await.unwrap();
        store
    }

    fn predicate(user_id: Uuid) -> AccessPredicate {
        AccessPredicate {
            user_id,
            teams: vec![],
            orgs: vec![],
            required: PermissionLevel::Read,
        }
    }

    #[tokio::test]
    async fn test_document_round_trip() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let created = store
            .create_document(
                NewDocument::new(owner, "specs.md").with_tags(vec!["hardware".into()]),
            )
            .await
            .unwrap();

        let fetched = store
            .get_document(created.id, &predicate(owner))
            .await
            .unwrap();
        assert_eq!(fetched.filename, "specs.md");
        assert_eq!(fetched.tags, vec!["hardware".to_string()]);
        assert_eq!(fetched.status, DocumentStatus::Pending);
        assert_eq!(fetched.version, 0);
    }

    #[tokio::test]
    async fn test_predicate_hides_other_users_documents() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let doc = store
            .create_document(NewDocument::new(owner, "secrets.txt"))
            .await
            .unwrap();

        let err = store
            .get_document(doc.id, &predicate(stranger))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        // Public documents are readable by anyone.
        store
            .set_visibility(doc.id, Visibility::Public)
            .await
            .unwrap();
        assert!(store.get_document(doc.id, &predicate(stranger)).await.is_ok());
    }

    #[tokio::test]
    async fn test_grant_reaches_through_predicate() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let doc = store
            .create_document(NewDocument::new(owner, "report.pdf"))
            .await
            .unwrap();

        assert!(!store
            .document_passes(doc.id, &predicate(reader))
            .await
            .unwrap());

        store
            .upsert_permission(doc.id, &reader.to_string(), GranteeKind::User, PermissionLevel::Read)
            .await
            .unwrap();
        assert!(store
            .document_passes(doc.id, &predicate(reader))
            .await
            .unwrap());

        store
            .delete_permission(doc.id, &reader.to_string(), GranteeKind::User)
            .await
            .unwrap();
        assert!(!store
            .document_passes(doc.id, &predicate(reader))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_team_grant() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let member = Uuid::new_v4();
        let doc = store
            .create_document(NewDocument::new(owner, "roadmap.md"))
            .await
            .unwrap();
        store
            .upsert_permission(doc.id, "search-team", GranteeKind::Team, PermissionLevel::Read)
            .await
            .unwrap();

        let mut pred = predicate(member);
        assert!(!store.document_passes(doc.id, &pred).await.unwrap());
        pred.teams = vec!["search-team".to_string()];
        assert!(store.document_passes(doc.id, &pred).await.unwrap());
    }

    #[tokio::test]
    async fn test_required_level_filters_low_grants() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let doc = store
            .create_document(NewDocument::new(owner, "draft.md"))
            .await
            .unwrap();
        store
            .upsert_permission(doc.id, &reader.to_string(), GranteeKind::User, PermissionLevel::Read)
            .await
            .unwrap();

        let mut pred = predicate(reader);
        pred.required = PermissionLevel::Write;
        assert!(!store.document_passes(doc.id, &pred).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_chunks_atomic_and_versioned() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let doc = store
            .create_document(NewDocument::new(owner, "a.txt"))
            .await
            .unwrap();

        let chunks = vec![
            NewChunk {
                index: 0,
                content: "first".into(),
                metadata: json!({}),
            },
            NewChunk {
                index: 1,
                content: "second".into(),
                metadata: json!({}),
            },
        ];
        let v1 = store.replace_chunks(doc.id, 0, &chunks).await.unwrap();
        assert_eq!(v1, 1);

        // Stale version loses deterministically.
        let err = store.replace_chunks(doc.id, 0, &chunks).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));

        let stored = store.chunks_for(doc.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].index, 0);
        assert_eq!(stored[1].content, "second");
        assert_eq!(stored[0].id, chunk_id_for(doc.id, 0, "first"));
    }

    #[tokio::test]
    async fn test_replace_chunks_rejects_gaps() {
        let store = store().await;
        let doc = store
            .create_document(NewDocument::new(Uuid::new_v4(), "a.txt"))
            .await
            .unwrap();
        let chunks = vec![NewChunk {
            index: 1,
            content: "gap".into(),
            metadata: json!({}),
        }];
        let err = store.replace_chunks(doc.id, 0, &chunks).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_chunk_ids_are_deterministic() {
        let doc = Uuid::new_v4();
        assert_eq!(chunk_id_for(doc, 0, "abc"), chunk_id_for(doc, 0, "abc"));
        assert_ne!(chunk_id_for(doc, 0, "abc"), chunk_id_for(doc, 1, "abc"));
        assert_ne!(chunk_id_for(doc, 0, "abc"), chunk_id_for(doc, 0, "abd"));
    }

    #[tokio::test]
    async fn test_conversation_history_windowing() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let conversation = store.create_conversation(owner).await.unwrap();
        for i in 0..5 {
            store
                .append_message(
                    conversation.id,
                    if i % 2 == 0 {
                        MessageRole::User
                    } else {
                        MessageRole::Assistant
                    },
                    &format!("message {}", i),
                    None,
                )
                .await
                .unwrap();
        }

        let history = store.history(conversation.id, 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "message 2");
        assert_eq!(history[2].content, "message 4");
    }

    #[tokio::test]
    async fn test_job_lifecycle_and_idempotency() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let job = store.create_job(owner, 3, Some("batch-1")).await.unwrap();

        let found = store.find_job_by_key(owner, "batch-1").await.unwrap();
        assert_eq!(found.unwrap().id, job.id);
        assert!(store.find_job_by_key(owner, "batch-2").await.unwrap().is_none());

        store.set_job_status(job.id, JobStatus::Running).await.unwrap();
        store.set_job_progress(job.id, 2).await.unwrap();
        let job = store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.processed, 2);
        assert!(job.processed <= job.total);
    }

    #[tokio::test]
    async fn test_process_log_seal_is_final() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let id = Uuid::new_v4();
        store.create_process_log(id, owner, None).await.unwrap();
        store
            .update_process_log(id, &json!([{"stage": "analysis"}]))
            .await
            .unwrap();
        store
            .seal_process_log(id, &json!([{"stage": "analysis"}]), &json!({"verification_status": "verified"}))
            .await
            .unwrap();

        // Immutable once sealed.
        assert!(store.update_process_log(id, &json!([])).await.is_err());
        assert!(store
            .seal_process_log(id, &json!([]), &json!({}))
            .await
            .is_err());

        let report = store.get_report(id, owner).await.unwrap();
        assert_eq!(report["verification_status"], "verified");

        // Reports are owner-scoped.
        assert!(store.get_report(id, Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_analytics_counters() {
        let store = store().await;
        let owner = Uuid::new_v4();
        store.bump_metric(owner, "queries", 1).await.unwrap();
        store.bump_metric(owner, "queries", 2).await.unwrap();
        store.bump_metric(owner, "documents", 1).await.unwrap();

        let metrics = store.metrics_for(owner).await.unwrap();
        assert_eq!(metrics["queries"], 3);
        assert_eq!(metrics["documents"], 1);
    }
}
