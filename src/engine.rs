//! Engine facade.
//!
//! Owns the wired component graph and exposes the two external surfaces:
//! the ingestion API (`submit`, `job_status`, `cancel`) and the query API
//! (`query`, `audit_report`), plus sharing, deletion, health, and
//! shutdown. Every query ends with a sealed audit report, success or not.

use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{AccessControl, GranteeKind, PermissionLevel, UserContext, Visibility};
use crate::audit::{
    AuditReport, HallucinationAssessment, ProcessLogger, StageKind, StageRecord,
    VerificationStatus,
};
use crate::blobs::BlobStore;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ingestion::{DocumentUpload, IngestionPipeline, JobProgress};
use crate::llm::{GatedClient, LlmClient, OllamaClient};
use crate::query::{PlanExecutor, Planner, QueryAnalyzer, Retriever};
use crate::resources::{HealthStatus, ResourceKind, ResourceManager};
use crate::store::{Citation, DocumentStore, MessageRole};
use crate::tools::{CalculatorTool, DatabaseTool, RagTool, ToolRegistry};
use crate::vector::VectorIndex;

/// A query request.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub user: UserContext,
    pub text: String,
    pub conversation_id: Option<Uuid>,
    /// Overrides `retrieval.top_k`.
    pub top_k: Option<usize>,
    /// Tools the caller permits; defaults to everything registered.
    pub tools: Option<Vec<String>>,
    /// Overrides `deadlines.query_ms`.
    pub deadline_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(user: UserContext, text: impl Into<String>) -> Self {
        Self {
            user,
            text: text.into(),
            conversation_id: None,
            top_k: None,
            tools: None,
            deadline_ms: None,
        }
    }
}

/// A query answer with its audit trail handle.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub audit_report_id: Uuid,
}

/// The assembled engine.
pub struct Engine {
    config: EngineConfig,
    resources: ResourceManager,
    store: Arc<DocumentStore>,
    vector: Arc<VectorIndex>,
    blobs: Arc<BlobStore>,
    llm: Arc<dyn LlmClient>,
    access: Arc<AccessControl>,
    registry: Arc<ToolRegistry>,
    pipeline: Arc<IngestionPipeline>,
    analyzer: QueryAnalyzer,
    executor: PlanExecutor,
}

impl Engine {
    /// Open an engine against a data directory, talking to the configured
    /// LLM server.
    pub async fn open(config: EngineConfig, data_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let llm: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(config.llm.clone())?);
        Self::with_llm(config, data_dir, llm).await
    }

    /// Open with a caller-supplied LLM client (the test seam and the hook
    /// for alternative providers).
    pub async fn with_llm(
        config: EngineConfig,
        data_dir: impl AsRef<Path>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::Config(format!("cannot create data dir: {}", e)))?;

        let store_path = data_dir.join("quarry.db");
        let vector_path = data_dir.join("vectors.db");
        let resources = ResourceManager::new(
            &config.resources,
            connection_factory(store_path),
            connection_factory(vector_path),
        );

        let store = Arc::new(DocumentStore::new(resources.store_pool().clone()));
        store.initialize().await?;
        let vector = Arc::new(VectorIndex::new(resources.vector_pool().clone()));
        vector.initialize().await?;
        let blobs = Arc::new(BlobStore::new(
            data_dir.join("blobs"),
            resources.blob_gate().clone(),
        ));
        let llm: Arc<dyn LlmClient> =
            Arc::new(GatedClient::new(llm, resources.llm_gate().clone()));

        let access = Arc::new(AccessControl::new(Arc::clone(&store), Arc::clone(&vector)));

        let retriever = Arc::new(Retriever::new(
            Arc::clone(&store),
            Arc::clone(&vector),
            Arc::clone(&access),
            Arc::clone(&llm),
            config.retrieval.clone(),
            config.judge.clone(),
        ));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(RagTool::new(
            Arc::clone(&retriever),
            config.retrieval.top_k,
        )));
        registry.register(Arc::new(CalculatorTool::new()));
        registry.register(Arc::new(DatabaseTool::new(
            Arc::clone(&store),
            Arc::clone(&access),
        )));
        let registry = Arc::new(registry);

        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&vector),
            Arc::clone(&blobs),
            Arc::clone(&llm),
            Arc::clone(&access),
            config.clone(),
        ));

        let analyzer = QueryAnalyzer::new(Arc::clone(&llm));
        let executor = PlanExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&llm),
            config.response.clone(),
            config.deadlines.clone(),
        );

        info!("engine assembled");
        Ok(Arc::new(Self {
            config,
            resources,
            store,
            vector,
            blobs,
            llm,
            access,
            registry,
            pipeline,
            analyzer,
            executor,
        }))
    }

    // ==================== Ingestion API ====================

    pub async fn submit(
        &self,
        documents: Vec<DocumentUpload>,
        idempotency_key: Option<String>,
    ) -> Result<Uuid> {
        self.pipeline.submit(documents, idempotency_key).await
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<JobProgress> {
        self.pipeline.job_status(job_id).await
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        self.pipeline.cancel(job_id).await
    }

    // ==================== Query API ====================

    /// Answer a query. Always seals an audit report; on hard failure the
    /// answer carries a terse, non-leaking explanation and the report
    /// records the failed stage.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let mut logger = ProcessLogger::start(
            Arc::clone(&self.store),
            request.user.user_id,
            request.conversation_id,
        )
        .await?;
        let report_id = logger.id();

        match self.run_query(&request, &mut logger).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(error = %e, "query failed, sealing report");
                let answer = match &e {
                    Error::Timeout { .. } => {
                        "The query timed out before an answer could be produced.".to_string()
                    }
                    Error::NotAuthorized => "You are not authorized for this query.".to_string(),
                    _ => "The query could not be completed.".to_string(),
                };
                let report = AuditReport {
                    id: report_id,
                    sources: vec![],
                    reasoning_trace: logger.reasoning_trace(),
                    hallucination_assessment: HallucinationAssessment::default(),
                    verification_status: VerificationStatus::Unknown,
                    failed_stage: Some(e.to_string()),
                };
                if let Err(seal_error) = logger.seal(&report).await {
                    warn!(error = %seal_error, "failed to seal report after error");
                }
                Ok(QueryResponse {
                    answer,
                    citations: vec![],
                    audit_report_id: report_id,
                })
            }
        }
    }

    async fn run_query(
        &self,
        request: &QueryRequest,
        logger: &mut ProcessLogger,
    ) -> Result<QueryResponse> {
        if request.text.trim().is_empty() {
            return Err(Error::validation("text", "must not be empty"));
        }

        // History, when the query belongs to a conversation the caller owns.
        let history: Vec<String> = match request.conversation_id {
            Some(conversation_id) => {
                let conversation = self.store.get_conversation(conversation_id).await?;
                if conversation.owner_id != request.user.user_id {
                    warn!(%conversation_id, user = %request.user.user_id, "conversation owned by another user");
                    return Err(Error::NotAuthorized);
                }
                self.store
                    .history(conversation_id, self.config.response.history_window)
                    .await?
                    .iter()
                    .map(|m| format!("{}: {}", m.role.as_str(), m.content))
                    .collect()
            }
            None => Vec::new(),
        };

        let permitted: Vec<String> = request
            .tools
            .clone()
            .unwrap_or_else(|| self.registry.names().iter().map(|s| s.to_string()).collect());

        let analysis = self.analyzer.analyze(&request.text, &permitted).await;
        logger.append(
            StageRecord::new(
                StageKind::Analysis,
                format!("classified {:?}", analysis.complexity),
            )
            .with_detail("requires_tools", json!(analysis.requires_tools))
            .with_detail("sub_queries", json!(analysis.sub_queries))
            .with_detail("fallback", json!(analysis.fallback)),
        );

        let planner = Planner::new(request.top_k.unwrap_or(self.config.retrieval.top_k));
        let mut plan = planner.build(
            request.user.user_id,
            &request.text,
            &analysis,
            &self.registry,
            &permitted,
        );
        logger.append(
            StageRecord::new(StageKind::Planning, format!("{} steps", plan.steps.len()))
                .with_detail(
                    "steps",
                    json!(plan
                        .steps
                        .iter()
                        .map(|s| s.description.clone())
                        .collect::<Vec<_>>()),
                ),
        );
        logger.flush().await?;

        let outcome = self
            .executor
            .execute(&mut plan, &request.user, &history, request.deadline_ms, logger)
            .await?;

        let hallucination_score = outcome.evaluation.as_ref().map(|e| e.hallucination);
        let verification_status = if outcome.sources.is_empty() {
            VerificationStatus::NotVerified
        } else {
            VerificationStatus::from_hallucination(
                hallucination_score,
                self.config.response.hallucination_threshold,
                self.config.response.verification_partial_floor,
            )
        };

        let report = AuditReport {
            id: logger.id(),
            sources: outcome.sources.clone(),
            reasoning_trace: logger.reasoning_trace(),
            hallucination_assessment: HallucinationAssessment {
                score: hallucination_score,
                flagged_spans: outcome
                    .evaluation
                    .as_ref()
                    .map(|e| e.hallucinated_spans.clone())
                    .unwrap_or_default(),
            },
            verification_status,
            failed_stage: None,
        };
        logger.seal(&report).await?;

        self.store
            .bump_metric(request.user.user_id, "queries", 1)
            .await?;

        // Conversation history is only written for completed queries.
        if let Some(conversation_id) = request.conversation_id {
            self.store
                .append_message(conversation_id, MessageRole::User, &request.text, None)
                .await?;
            self.store
                .append_message(
                    conversation_id,
                    MessageRole::Assistant,
                    &outcome.answer,
                    Some(&outcome.citations),
                )
                .await?;
        }

        Ok(QueryResponse {
            answer: outcome.answer,
            citations: outcome.citations,
            audit_report_id: report.id,
        })
    }

    /// Fetch a sealed audit report. Owner-scoped.
    pub async fn audit_report(&self, user: &UserContext, report_id: Uuid) -> Result<AuditReport> {
        let value = self.store.get_report(report_id, user.user_id).await?;
        Ok(serde_json::from_value(value)?)
    }

    // ==================== Sharing & documents ====================

    pub async fn share(
        &self,
        document_id: Uuid,
        grantee: impl Into<String>,
        kind: GranteeKind,
        level: PermissionLevel,
        by_user: &UserContext,
    ) -> Result<()> {
        self.access
            .share(document_id, grantee, kind, level, by_user)
            .await
    }

    pub async fn revoke(
        &self,
        document_id: Uuid,
        grantee: &str,
        kind: GranteeKind,
        by_user: &UserContext,
    ) -> Result<()> {
        self.access.revoke(document_id, grantee, kind, by_user).await
    }

    pub async fn set_visibility(
        &self,
        document_id: Uuid,
        visibility: Visibility,
        by_user: &UserContext,
    ) -> Result<()> {
        self.access
            .set_visibility(document_id, visibility, by_user)
            .await
    }

    /// Destroy a document: chunks and permissions cascade, embeddings and
    /// the blob go with them. Requires admin on the document.
    pub async fn delete_document(&self, document_id: Uuid, by_user: &UserContext) -> Result<()> {
        if !self
            .access
            .check(by_user, document_id, PermissionLevel::Admin)
            .await?
        {
            return Err(Error::NotAuthorized);
        }
        let document = self.store.get_document_unchecked(document_id).await?;
        self.vector.delete_document(document_id).await?;
        self.blobs.delete(document.owner_id, document_id).await?;
        self.store.delete_document(document_id).await?;
        info!(%document_id, "document destroyed");
        Ok(())
    }

    // ==================== Lifecycle ====================

    pub fn health(&self) -> HashMap<ResourceKind, HealthStatus> {
        self.resources.health()
    }

    /// Probe the LLM server.
    pub async fn llm_health(&self) -> bool {
        self.llm.list_models().await.is_ok()
    }

    /// Drain all pools; in-flight work finishes, new work is refused.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.resources.shutdown(deadline).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn connection_factory(
    path: PathBuf,
) -> impl Fn() -> Result<Connection> + Send + Sync + 'static {
    move || Connection::open(&path).map_err(Error::from)
}
