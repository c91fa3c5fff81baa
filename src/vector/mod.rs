//! Vector index adapter.
//!
//! Embeddings live outside the relational schema, keyed by chunk id, each
//! carrying a metadata envelope with the document's permission snapshot.
//! The index is SQLite-persisted; filters are evaluated exactly inside the
//! adapter, so queries never return rows outside the predicate. Scores are
//! cosine similarity mapped to [0, 1].

mod filter;

pub use filter::MetadataFilter;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::access::Visibility;
use crate::error::{Error, Result};
use crate::resources::Pool;

/// Required metadata carried by every embedding: the permission snapshot
/// of its chunk at tag time. Kept in sync by re-tags on permission change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingEnvelope {
    pub document_id: String,
    pub owner_id: String,
    pub visibility: Visibility,
    /// Users granted read or better.
    #[serde(default)]
    pub read_users: Vec<String>,
    /// Teams granted read or better.
    #[serde(default)]
    pub read_teams: Vec<String>,
    /// Organizations granted read or better.
    #[serde(default)]
    pub read_orgs: Vec<String>,
}

/// One query hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: Uuid,
    /// Similarity in [0, 1].
    pub score: f64,
    pub envelope: EmbeddingEnvelope,
}

/// SQLite-persisted vector index with exact metadata filtering.
pub struct VectorIndex {
    pool: Pool<Connection>,
}

impl VectorIndex {
    pub fn new(pool: Pool<Connection>) -> Self {
        Self { pool }
    }

    /// Create the backing table. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS embeddings (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                vector BLOB NOT NULL,
                dims INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_document
                ON embeddings(document_id);",
        )?;
        Ok(())
    }

    /// Insert or replace one embedding with its metadata envelope.
    pub async fn upsert(
        &self,
        chunk_id: Uuid,
        embedding: &[f32],
        envelope: &EmbeddingEnvelope,
    ) -> Result<()> {
        if embedding.is_empty() {
            return Err(Error::validation("embedding", "must not be empty"));
        }
        let conn = self.pool.acquire().await?;
        let metadata = serde_json::to_string(envelope)?;
        conn.execute(
            "INSERT INTO embeddings (chunk_id, document_id, vector, dims, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chunk_id) DO UPDATE SET
                 document_id = excluded.document_id,
                 vector = excluded.vector,
                 dims = excluded.dims,
                 metadata = excluded.metadata",
            params![
                chunk_id.to_string(),
                envelope.document_id,
                vector_to_blob(embedding),
                embedding.len() as i64,
                metadata,
            ],
        )?;
        Ok(())
    }

    /// Batched ordered upsert for one document, inside a transaction.
    pub async fn upsert_batch(
        &self,
        entries: &[(Uuid, Vec<f32>)],
        envelope: &EmbeddingEnvelope,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let metadata = serde_json::to_string(envelope)?;
        let tx = conn.transaction()?;
        for (chunk_id, embedding) in entries {
            if embedding.is_empty() {
                return Err(Error::validation("embedding", "must not be empty"));
            }
            tx.execute(
                "INSERT INTO embeddings (chunk_id, document_id, vector, dims, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                     document_id = excluded.document_id,
                     vector = excluded.vector,
                     dims = excluded.dims,
                     metadata = excluded.metadata",
                params![
                    chunk_id.to_string(),
                    envelope.document_id,
                    vector_to_blob(embedding),
                    embedding.len() as i64,
                    metadata,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Top-k similarity query under a metadata predicate.
    ///
    /// Returns at most `k` chunks whose envelope satisfies `filter` and
    /// whose score clears `floor`, best first.
    pub async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
        floor: f64,
    ) -> Result<Vec<ScoredChunk>> {
        let conn = self.pool.acquire().await?;

        let mut stmt =
            conn.prepare("SELECT chunk_id, vector, dims, metadata FROM embeddings")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (chunk_id, blob, dims, metadata_json) = row?;
            let metadata: serde_json::Value = serde_json::from_str(&metadata_json)?;
            if !filter.matches(&metadata) {
                continue;
            }
            if dims as usize != embedding.len() {
                continue;
            }
            let vector = blob_to_vector(&blob);
            let score = similarity(embedding, &vector);
            if score < floor {
                continue;
            }
            let envelope: EmbeddingEnvelope = serde_json::from_value(metadata)?;
            let chunk_id = Uuid::parse_str(&chunk_id)
                .map_err(|e| Error::VectorIndex(format!("bad chunk id: {}", e)))?;
            hits.push(ScoredChunk {
                chunk_id,
                score,
                envelope,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        debug!(k, hits = hits.len(), "vector query complete");
        Ok(hits)
    }

    /// Replace the metadata envelope of one chunk without touching its
    /// vector.
    pub async fn tag_update(&self, chunk_id: Uuid, envelope: &EmbeddingEnvelope) -> Result<()> {
        let conn = self.pool.acquire().await?;
        let updated = conn.execute(
            "UPDATE embeddings SET metadata = ?2 WHERE chunk_id = ?1",
            params![chunk_id.to_string(), serde_json::to_string(envelope)?],
        )?;
        if updated == 0 {
            return Err(Error::not_found("embedding", chunk_id.to_string()));
        }
        Ok(())
    }

    /// Re-tag every vector of a document. Returns the number updated.
    pub async fn tag_document(
        &self,
        document_id: Uuid,
        envelope: &EmbeddingEnvelope,
    ) -> Result<usize> {
        let conn = self.pool.acquire().await?;
        let updated = conn.execute(
            "UPDATE embeddings SET metadata = ?2 WHERE document_id = ?1",
            params![document_id.to_string(), serde_json::to_string(envelope)?],
        )?;
        Ok(updated)
    }

    /// Delete one chunk's embedding.
    pub async fn delete_chunk(&self, chunk_id: Uuid) -> Result<bool> {
        let conn = self.pool.acquire().await?;
        let deleted = conn.execute(
            "DELETE FROM embeddings WHERE chunk_id = ?1",
            params![chunk_id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    /// Delete all embeddings of a document. Returns the number removed.
    pub async fn delete_document(&self, document_id: Uuid) -> Result<usize> {
        let conn = self.pool.acquire().await?;
        let deleted = conn.execute(
            "DELETE FROM embeddings WHERE document_id = ?1",
            params![document_id.to_string()],
        )?;
        Ok(deleted)
    }

    /// Number of stored embeddings.
    pub async fn len(&self) -> Result<usize> {
        let conn = self.pool.acquire().await?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity mapped from [-1, 1] to [0, 1].
fn similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    (cosine + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_pool;

    fn envelope(owner: &str, visibility: Visibility) -> EmbeddingEnvelope {
        EmbeddingEnvelope {
            document_id: Uuid::new_v4().to_string(),
            owner_id: owner.to_string(),
            visibility,
            read_users: vec![],
            read_teams: vec![],
            read_orgs: vec![],
        }
    }

    #[tokio::test]
    async fn test_upsert_query_round_trip() {
        let index = VectorIndex::new(memory_pool("vec_round_trip"));
        index.initialize().await.unwrap();

        let env = envelope("alice", Visibility::Private);
        let id = Uuid::new_v4();
        index.upsert(id, &[1.0, 0.0, 0.0], &env).await.unwrap();

        let filter = MetadataFilter::eq("owner_id", "alice");
        let hits = index.query(&[1.0, 0.0, 0.0], 5, &filter, 0.4).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, id);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_query_respects_filter() {
        let index = VectorIndex::new(memory_pool("vec_filter"));
        index.initialize().await.unwrap();

        index
            .upsert(Uuid::new_v4(), &[1.0, 0.0], &envelope("alice", Visibility::Private))
            .await
            .unwrap();
        index
            .upsert(Uuid::new_v4(), &[1.0, 0.0], &envelope("bob", Visibility::Private))
            .await
            .unwrap();

        let filter = MetadataFilter::eq("owner_id", "bob");
        let hits = index.query(&[1.0, 0.0], 10, &filter, 0.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].envelope.owner_id, "bob");
    }

    #[tokio::test]
    async fn test_relevance_floor() {
        let index = VectorIndex::new(memory_pool("vec_floor"));
        index.initialize().await.unwrap();

        let env = envelope("alice", Visibility::Private);
        index.upsert(Uuid::new_v4(), &[1.0, 0.0], &env).await.unwrap();
        // Orthogonal vector maps to score 0.5.
        let hits = index
            .query(&[0.0, 1.0], 5, &MetadataFilter::all(vec![]), 0.6)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_tag_document_rewrites_envelope() {
        let index = VectorIndex::new(memory_pool("vec_tag"));
        index.initialize().await.unwrap();

        let mut env = envelope("alice", Visibility::Private);
        let doc_id = Uuid::parse_str(&env.document_id).unwrap();
        index.upsert(Uuid::new_v4(), &[1.0], &env).await.unwrap();
        index.upsert(Uuid::new_v4(), &[0.5], &env).await.unwrap();

        env.visibility = Visibility::Public;
        let updated = index.tag_document(doc_id, &env).await.unwrap();
        assert_eq!(updated, 2);

        let hits = index
            .query(&[1.0], 10, &MetadataFilter::eq("visibility", "public"), 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_document() {
        let index = VectorIndex::new(memory_pool("vec_delete"));
        index.initialize().await.unwrap();

        let env = envelope("alice", Visibility::Private);
        let doc_id = Uuid::parse_str(&env.document_id).unwrap();
        index.upsert(Uuid::new_v4(), &[1.0], &env).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);

        assert_eq!(index.delete_document(doc_id).await.unwrap(), 1);
        assert!(index.is_empty().await.unwrap());
    }

    #[test]
    fn test_similarity_bounds() {
        assert!((similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((similarity(&[1.0, 0.0], &[-1.0, 0.0])).abs() < 1e-9);
        assert!((similarity(&[1.0, 0.0], &[0.0, 1.0]) - 0.5).abs() < 1e-9);
        assert_eq!(similarity(&[0.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(blob_to_vector(&vector_to_blob(&v)), v);
    }
}
