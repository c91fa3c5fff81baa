//! Security-aware retrieval loop.
//!
//! Each iteration queries the vector index under the caller's predicate,
//! re-checks every hit against the store's current permissions (dropped
//! ids are logged as potential permission-change events), and consults
//! the retrieval judge for a refined query. Results union across
//! iterations, de-duplicated by chunk id, judge-filtered, tie-broken, and
//! capped at `top_k`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::judge::{JudgeVerdict, RetrievalJudge};
use crate::access::{AccessControl, PermissionLevel, UserContext};
use crate::config::{JudgeConfig, RetrievalConfig};
use crate::error::Result;
use crate::llm::{EmbedRequest, LlmClient};
use crate::store::DocumentStore;
use crate::vector::VectorIndex;

/// One retrieved chunk with everything needed for synthesis, citations,
/// and tie-breaking.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub index: u32,
    pub content: String,
    pub filename: String,
    pub score: f64,
    pub document_created_at: DateTime<Utc>,
}

/// Result of a full retrieval loop.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RetrievalOutcome {
    pub chunks: Vec<RetrievedChunk>,
    pub iterations: u32,
    /// Queries actually executed, the original first.
    pub queries: Vec<String>,
    /// Chunks removed by the post-retrieval permission check.
    pub dropped_chunk_ids: Vec<Uuid>,
    /// Whether the judge produced a usable verdict at least once.
    pub judge_consulted: bool,
}

/// The bounded judge-driven retrieval loop.
pub struct Retriever {
    store: Arc<DocumentStore>,
    vector: Arc<VectorIndex>,
    access: Arc<AccessControl>,
    llm: Arc<dyn LlmClient>,
    judge: RetrievalJudge,
    retrieval: RetrievalConfig,
    judge_config: JudgeConfig,
}

impl Retriever {
    pub fn new(
        store: Arc<DocumentStore>,
        vector: Arc<VectorIndex>,
        access: Arc<AccessControl>,
        llm: Arc<dyn LlmClient>,
        retrieval: RetrievalConfig,
        judge_config: JudgeConfig,
    ) -> Self {
        let judge = RetrievalJudge::new(Arc::clone(&llm));
        Self {
            store,
            vector,
            access,
            llm,
            judge,
            retrieval,
            judge_config,
        }
    }

    pub async fn retrieve(
        &self,
        user: &UserContext,
        query: &str,
        top_k: usize,
        history: &[String],
    ) -> Result<RetrievalOutcome> {
        let predicate = self.access.filter_for(user, PermissionLevel::Read);
        let filter = predicate.vector_filter();

        let mut outcome = RetrievalOutcome::default();
        let mut seen: HashMap<Uuid, RetrievedChunk> = HashMap::new();
        // Permissions are re-read per document once per request, never
        // cached across requests.
        let mut permission_cache: HashMap<Uuid, bool> = HashMap::new();
        let mut current_query = query.to_string();
        let mut last_verdict: Option<JudgeVerdict> = None;

        for iteration in 0..self.retrieval.max_iterations {
            outcome.iterations = iteration + 1;
            outcome.queries.push(current_query.clone());

            let embedding = self
                .llm
                .embed(EmbedRequest::single(current_query.clone()))
                .await?;
            let embedding = embedding
                .embeddings
                .into_iter()
                .next()
                .unwrap_or_default();

            let hits = self
                .vector
                .query(
                    &embedding,
                    top_k,
                    &filter,
                    self.retrieval.relevance_floor,
                )
                .await?;
            debug!(iteration, hits = hits.len(), "vector query");

            // Post-retrieval check against current store permissions.
            let mut allowed_ids = Vec::with_capacity(hits.len());
            for hit in &hits {
                let document_id = match Uuid::parse_str(&hit.envelope.document_id) {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                let allowed = match permission_cache.get(&document_id) {
                    Some(allowed) => *allowed,
                    None => {
                        let allowed = self
                            .access
                            .check(user, document_id, PermissionLevel::Read)
                            .await
                            .unwrap_or(false);
                        permission_cache.insert(document_id, allowed);
                        allowed
                    }
                };
                if allowed {
                    allowed_ids.push((hit.chunk_id, hit.score));
                } else {
                    warn!(
                        chunk_id = %hit.chunk_id,
                        %document_id,
                        "post-filter dropped chunk; possible permission change"
                    );
                    outcome.dropped_chunk_ids.push(hit.chunk_id);
                }
            }

            let loaded = self
                .store
                .chunks_by_ids(&allowed_ids.iter().map(|(id, _)| *id).collect::<Vec<_>>())
                .await?;
            let scores: HashMap<Uuid, f64> = allowed_ids.into_iter().collect();
            for row in loaded {
                let score = scores.get(&row.chunk.id).copied().unwrap_or(0.0);
                seen.entry(row.chunk.id).or_insert(RetrievedChunk {
                    chunk_id: row.chunk.id,
                    document_id: row.chunk.document_id,
                    index: row.chunk.index,
                    content: row.chunk.content,
                    filename: row.filename,
                    score,
                    document_created_at: row.document_created_at,
                });
            }

            let is_last = iteration + 1 >= self.retrieval.max_iterations;
            if is_last || !self.judge_config.retrieval_enabled {
                break;
            }

            let chunks: Vec<RetrievedChunk> = seen.values().cloned().collect();
            let verdict = self.judge.evaluate(query, &chunks, history).await;
            if !verdict.fallback {
                outcome.judge_consulted = true;
            }
            let refine = verdict.request_more;
            let refined_query = verdict.refined_query.clone();
            last_verdict = Some(verdict);

            match (refine, refined_query) {
                (true, Some(refined)) => {
                    info!(refined = %refined, "retrieval judge refined query");
                    current_query = refined;
                }
                // Requesting more without a refined query ends the loop.
                _ => break,
            }
        }

        let mut chunks: Vec<RetrievedChunk> = seen.into_values().collect();
        if let Some(verdict) = &last_verdict {
            if let Some(relevant) = &verdict.relevant_chunks {
                chunks.retain(|chunk| relevant.contains(&chunk.chunk_id));
            }
        }

        sort_with_tie_breaks(&mut chunks);
        if let Some(order) = last_verdict
            .as_ref()
            .and_then(|v| v.re_rank_chunks.as_ref())
        {
            apply_re_rank(&mut chunks, order);
        }
        chunks.truncate(top_k);
        outcome.chunks = chunks;
        Ok(outcome)
    }
}

/// Score descending; at equal scores an earlier chunk within the same
/// document wins, and across documents the most recently uploaded wins.
fn sort_with_tie_breaks(chunks: &mut [RetrievedChunk]) {
    chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                if a.document_id == b.document_id {
                    a.index.cmp(&b.index)
                } else {
                    b.document_created_at.cmp(&a.document_created_at)
                }
            })
    });
}

/// Stable re-rank: listed ids first in the judge's order, everything else
/// after in existing order.
fn apply_re_rank(chunks: &mut Vec<RetrievedChunk>, order: &[Uuid]) {
    let position = |id: Uuid| order.iter().position(|o| *o == id);
    chunks.sort_by_key(|chunk| position(chunk.chunk_id).unwrap_or(usize::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Visibility;
    use crate::llm::testing::ScriptedLlm;
    use crate::store::{chunk_id_for, DocumentStore, NewChunk, NewDocument};
    use crate::testutil::memory_pool;
    use crate::vector::EmbeddingEnvelope;

    struct Fixture {
        store: Arc<DocumentStore>,
        vector: Arc<VectorIndex>,
        access: Arc<AccessControl>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(DocumentStore::new(memory_pool("retrieval")));
        store.initialize().await.unwrap();
        let vector = Arc::new(VectorIndex::new(memory_pool("retrieval_vec")));
        vector.initialize().await.unwrap();
        let access = Arc::new(AccessControl::new(Arc::clone(&store), Arc::clone(&vector)));
        Fixture {
            store,
            vector,
            access,
        }
    }

    impl Fixture {
        fn retriever(&self, llm: Arc<dyn LlmClient>, judge_enabled: bool) -> Retriever {
            let mut judge_config = crate::config::JudgeConfig::default();
            judge_config.retrieval_enabled = judge_enabled;
            Retriever::new(
                Arc::clone(&self.store),
                Arc::clone(&self.vector),
                Arc::clone(&self.access),
                llm,
                crate::config::RetrievalConfig::default(),
                judge_config,
            )
        }

        /// Ingest one single-chunk document and index it, optionally with
        /// an envelope that diverges from the store's permissions.
        async fn seed(
            &self,
            owner: Uuid,
            filename: &str,
            content: &str,
            envelope_read_users: Vec<String>,
        ) -> Uuid {
            let document = self
                .store
                .create_document(NewDocument::new(owner, filename))
                .await
                .unwrap();
            self.store
                .replace_chunks(
                    document.id,
                    0,
                    &[NewChunk {
                        index: 0,
                        content: content.to_string(),
                        metadata: serde_json::json!({}),
                    }],
                )
                .await
                .unwrap();
            let envelope = EmbeddingEnvelope {
                document_id: document.id.to_string(),
                owner_id: owner.to_string(),
                visibility: Visibility::Private,
                read_users: envelope_read_users,
                read_teams: vec![],
                read_orgs: vec![],
            };
            self.vector
                .upsert(
                    chunk_id_for(document.id, 0, content),
                    &ScriptedLlm::embedding_for(content, 8),
                    &envelope,
                )
                .await
                .unwrap();
            document.id
        }
    }

    #[tokio::test]
    async fn test_owner_retrieves_and_stranger_does_not() {
        let fixture = fixture().await;
        let owner = UserContext::new(Uuid::new_v4());
        let stranger = UserContext::new(Uuid::new_v4());
        fixture
            .seed(owner.user_id, "specs.md", "hub model X-200", vec![])
            .await;

        let retriever = fixture.retriever(Arc::new(ScriptedLlm::empty()), false);
        let mine = retriever
            .retrieve(&owner, "hub model", 5, &[])
            .await
            .unwrap();
        assert_eq!(mine.chunks.len(), 1);
        assert_eq!(mine.chunks[0].filename, "specs.md");
        assert_eq!(mine.iterations, 1);

        let theirs = retriever
            .retrieve(&stranger, "hub model", 5, &[])
            .await
            .unwrap();
        assert!(theirs.chunks.is_empty());
        assert!(theirs.dropped_chunk_ids.is_empty(), "pre-filter excluded them");
    }

    #[tokio::test]
    async fn test_post_filter_drops_stale_envelope_grants() {
        let fixture = fixture().await;
        let owner = Uuid::new_v4();
        let bob = UserContext::new(Uuid::new_v4());
        // The envelope still claims bob may read, but the store has no
        // grant: a revocation the index has not been re-tagged for yet.
        fixture
            .seed(
                owner,
                "report.pdf",
                "quarterly revenue",
                vec![bob.user_id.to_string()],
            )
            .await;

        let retriever = fixture.retriever(Arc::new(ScriptedLlm::empty()), false);
        let outcome = retriever
            .retrieve(&bob, "quarterly revenue", 5, &[])
            .await
            .unwrap();
        assert!(outcome.chunks.is_empty());
        assert_eq!(outcome.dropped_chunk_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_judge_refinement_runs_second_iteration() {
        let fixture = fixture().await;
        let owner = UserContext::new(Uuid::new_v4());
        fixture
            .seed(owner.user_id, "specs.md", "hub model X-200", vec![])
            .await;

        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new(vec![
            r#"{"request_more": true, "refined_query": "hub model number"}"#,
        ]));
        let retriever = fixture.retriever(llm, true);
        let outcome = retriever.retrieve(&owner, "hub?", 5, &[]).await.unwrap();
        assert_eq!(outcome.iterations, 2);
        assert_eq!(
            outcome.queries,
            vec!["hub?".to_string(), "hub model number".to_string()]
        );
        assert!(outcome.judge_consulted);
        assert_eq!(outcome.chunks.len(), 1, "union is de-duplicated");
    }

    #[tokio::test]
    async fn test_request_more_without_refined_query_stops() {
        let fixture = fixture().await;
        let owner = UserContext::new(Uuid::new_v4());
        fixture
            .seed(owner.user_id, "a.md", "content", vec![])
            .await;

        let llm: Arc<dyn LlmClient> =
            Arc::new(ScriptedLlm::new(vec![r#"{"request_more": true}"#]));
        let retriever = fixture.retriever(llm, true);
        let outcome = retriever.retrieve(&owner, "content", 5, &[]).await.unwrap();
        assert_eq!(outcome.iterations, 1);
    }

    fn chunk(doc: Uuid, index: u32, score: f64, uploaded_secs_ago: i64) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            document_id: doc,
            index,
            content: String::new(),
            filename: "f".into(),
            score,
            document_created_at: Utc::now() - chrono::Duration::seconds(uploaded_secs_ago),
        }
    }

    #[test]
    fn test_tie_break_prefers_earlier_chunk_in_same_document() {
        let doc = Uuid::new_v4();
        let mut chunks = vec![chunk(doc, 3, 0.8, 0), chunk(doc, 1, 0.8, 0)];
        sort_with_tie_breaks(&mut chunks);
        assert_eq!(chunks[0].index, 1);
    }

    #[test]
    fn test_tie_break_prefers_recent_document() {
        let mut chunks = vec![
            chunk(Uuid::new_v4(), 0, 0.8, 1000),
            chunk(Uuid::new_v4(), 0, 0.8, 10),
        ];
        sort_with_tie_breaks(&mut chunks);
        assert!(chunks[0].document_created_at > chunks[1].document_created_at);
    }

    #[test]
    fn test_score_dominates_tie_breaks() {
        let mut chunks = vec![
            chunk(Uuid::new_v4(), 0, 0.5, 10),
            chunk(Uuid::new_v4(), 0, 0.9, 1000),
        ];
        sort_with_tie_breaks(&mut chunks);
        assert_eq!(chunks[0].score, 0.9);
    }

    #[test]
    fn test_re_rank_puts_listed_ids_first() {
        let mut chunks = vec![
            chunk(Uuid::new_v4(), 0, 0.9, 0),
            chunk(Uuid::new_v4(), 0, 0.8, 0),
            chunk(Uuid::new_v4(), 0, 0.7, 0),
        ];
        let favored = chunks[2].chunk_id;
        apply_re_rank(&mut chunks, &[favored]);
        assert_eq!(chunks[0].chunk_id, favored);
    }
}
