//! Batched ingestion pipeline.
//!
//! A job moves `pending -> running -> (complete | failed | cancelled)`;
//! each document inside it walks `queued -> sampling -> judging ->
//! splitting -> embedding -> persisting -> done | failed`. A bounded
//! worker pool processes documents cooperatively; each document is one
//! unit of work with no partial-persist visibility. Document failures are
//! isolated; job failure is reserved for infrastructure faults.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{AccessControl, Visibility};
use crate::blobs::BlobStore;
use crate::chunking::{run_strategy, ChunkingJudge, SplitterParams};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::llm::{EmbedRequest, LlmClient};
use crate::store::{
    chunk_id_for, DocumentStage, DocumentStatus, DocumentStore, JobDocument, JobStatus,
    NewChunk, NewDocument,
};
use crate::vector::VectorIndex;

/// Embedding batch size; splitting work interleaves with these calls.
const EMBED_BATCH: usize = 16;

/// One document handed to `submit`.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub owner_id: Uuid,
    pub visibility: Visibility,
    pub tags: Vec<String>,
    pub folder: String,
}

impl DocumentUpload {
    pub fn new(owner_id: Uuid, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
            owner_id,
            visibility: Visibility::Private,
            tags: Vec::new(),
            folder: "/".to_string(),
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }
}

/// Snapshot returned by `job_status`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub processed: u32,
    pub total: u32,
    pub per_doc: Vec<JobDocument>,
}

struct JobControl {
    cancelled: Arc<AtomicBool>,
}

/// The ingestion pipeline.
pub struct IngestionPipeline {
    store: Arc<DocumentStore>,
    vector: Arc<VectorIndex>,
    blobs: Arc<BlobStore>,
    llm: Arc<dyn LlmClient>,
    access: Arc<AccessControl>,
    judge: ChunkingJudge,
    config: EngineConfig,
    /// Bounds queued documents across all running jobs.
    queue: Arc<Semaphore>,
    jobs: Mutex<HashMap<Uuid, JobControl>>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<DocumentStore>,
        vector: Arc<VectorIndex>,
        blobs: Arc<BlobStore>,
        llm: Arc<dyn LlmClient>,
        access: Arc<AccessControl>,
        config: EngineConfig,
    ) -> Self {
        let judge = ChunkingJudge::new(Arc::clone(&llm), config.chunking.clone());
        Self {
            store,
            vector,
            blobs,
            llm,
            access,
            judge,
            queue: Arc::new(Semaphore::new(config.ingestion.queue_bound)),
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a batch of documents and return the job id. With an
    /// idempotency key, a repeat submit returns the original job without
    /// duplicating work.
    pub async fn submit(
        self: &Arc<Self>,
        uploads: Vec<DocumentUpload>,
        idempotency_key: Option<String>,
    ) -> Result<Uuid> {
        if uploads.is_empty() {
            return Err(Error::validation("documents", "must not be empty"));
        }
        for upload in &uploads {
            if upload.filename.is_empty() {
                return Err(Error::validation("filename", "must not be empty"));
            }
        }
        let owner_id = uploads[0].owner_id;

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_job_by_key(owner_id, key).await? {
                debug!(job_id = %existing.id, key, "idempotent resubmit");
                return Ok(existing.id);
            }
        }

        // Back-pressure: take a queue slot per document, blocking or
        // failing fast per configuration.
        let wanted = uploads.len() as u32;
        let permits = if self.config.ingestion.fail_fast_enqueue {
            Arc::clone(&self.queue)
                .try_acquire_many_owned(wanted)
                .map_err(|_| Error::ResourceExhausted {
                    kind: "ingestion_queue".to_string(),
                })?
        } else {
            Arc::clone(&self.queue)
                .acquire_many_owned(wanted)
                .await
                .map_err(|_| Error::ResourceShutdown)?
        };

        let job = self
            .store
            .create_job(owner_id, uploads.len() as u32, idempotency_key.as_deref())
            .await?;

        let mut documents = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let document = self
                .store
                .create_document(
                    NewDocument {
                        owner_id: upload.owner_id,
                        filename: upload.filename.clone(),
                        folder: upload.folder.clone(),
                        tags: upload.tags.clone(),
                        metadata: serde_json::Value::Object(Default::default()),
                        visibility: upload.visibility,
                    },
                )
                .await?;
            self.blobs
                .put(upload.owner_id, document.id, &upload.bytes)
                .await?;
            self.store
                .upsert_job_document(job.id, document.id, DocumentStage::Queued, None)
                .await?;
            self.store.bump_metric(upload.owner_id, "documents", 1).await?;
            documents.push(document.id);
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.jobs.lock().map_err(|_| Error::Internal("job table poisoned".into()))?.insert(
            job.id,
            JobControl {
                cancelled: Arc::clone(&cancelled),
            },
        );

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.drive_job(job.id, documents, cancelled, permits).await;
        });

        info!(job_id = %job.id, "ingestion job submitted");
        Ok(job.id)
    }

    /// Progress snapshot for a job.
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobProgress> {
        let job = self.store.get_job(job_id).await?;
        let per_doc = self.store.job_documents(job_id).await?;
        Ok(JobProgress {
            job_id,
            status: job.status,
            processed: job.processed,
            total: job.total,
            per_doc,
        })
    }

    /// Request cancellation. Returns whether a running job was signalled.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        let signalled = {
            let jobs = self
                .jobs
                .lock()
                .map_err(|_| Error::Internal("job table poisoned".into()))?;
            match jobs.get(&job_id) {
                Some(control) => {
                    control.cancelled.store(true, Ordering::Release);
                    true
                }
                None => false,
            }
        };
        info!(%job_id, signalled, "ingestion cancel requested");
        Ok(signalled)
    }

    async fn drive_job(
        self: Arc<Self>,
        job_id: Uuid,
        documents: Vec<Uuid>,
        cancelled: Arc<AtomicBool>,
        queue_permits: OwnedSemaphorePermit,
    ) {
        if let Err(e) = self.store.set_job_status(job_id, JobStatus::Running).await {
            warn!(%job_id, error = %e, "failed to mark job running");
        }

        let workers = Arc::new(Semaphore::new(self.config.ingestion.worker_pool_size));
        let processed = Arc::new(AtomicU32::new(0));
        let progress_clock = Arc::new(Mutex::new(Instant::now()));
        let mut infrastructure_failure = false;

        let mut handles = Vec::with_capacity(documents.len());
        for document_id in documents {
            let permit = match Arc::clone(&workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if cancelled.load(Ordering::Acquire) {
                drop(permit);
                let _ = self
                    .store
                    .upsert_job_document(job_id, document_id, DocumentStage::Queued, None)
                    .await;
                continue;
            }

            let pipeline = Arc::clone(&self);
            let cancelled = Arc::clone(&cancelled);
            let processed = Arc::clone(&processed);
            let progress_clock = Arc::clone(&progress_clock);
            handles.push(tokio::spawn(async move {
                let result = pipeline
                    .process_document(job_id, document_id, &cancelled)
                    .await;
                drop(permit);

                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                pipeline
                    .publish_progress(job_id, done, &progress_clock, false)
                    .await;
                result
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // Per-document errors were already recorded; anything
                    // reaching here is an infrastructure fault.
                    warn!(%job_id, error = %e, "infrastructure fault during ingestion");
                    infrastructure_failure = true;
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "ingestion worker panicked");
                    infrastructure_failure = true;
                }
            }
        }

        self.publish_progress(job_id, processed.load(Ordering::SeqCst), &progress_clock, true)
            .await;

        let final_status = if infrastructure_failure {
            JobStatus::Failed
        } else if cancelled.load(Ordering::Acquire) {
            JobStatus::Cancelled
        } else {
            JobStatus::Complete
        };
        if let Err(e) = self.store.set_job_status(job_id, final_status).await {
            warn!(%job_id, error = %e, "failed to record final job status");
        }
        info!(%job_id, status = final_status.as_str(), "ingestion job finished");

        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&job_id);
        }
        drop(queue_permits);
    }

    /// Rate-limited progress persistence; the final update always lands.
    async fn publish_progress(
        &self,
        job_id: Uuid,
        processed: u32,
        clock: &Mutex<Instant>,
        force: bool,
    ) {
        let interval = Duration::from_millis(self.config.ingestion.progress_interval_ms);
        let due = force || {
            match clock.lock() {
                Ok(mut last) => {
                    if last.elapsed() >= interval {
                        *last = Instant::now();
                        true
                    } else {
                        false
                    }
                }
                Err(_) => true,
            }
        };
        if due {
            if let Err(e) = self.store.set_job_progress(job_id, processed).await {
                warn!(%job_id, error = %e, "failed to persist progress");
            }
        }
    }

    /// Process one document through all stages. `Ok` covers both success
    /// and an isolated, recorded document failure; `Err` means an
    /// infrastructure fault that fails the job.
    async fn process_document(
        &self,
        job_id: Uuid,
        document_id: Uuid,
        cancelled: &AtomicBool,
    ) -> Result<()> {
        match self.run_stages(job_id, document_id, cancelled).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                // Cancelled mid-step: discard work, roll back to pending.
                let _ = self
                    .store
                    .set_document_status(document_id, DocumentStatus::Pending, None)
                    .await;
                let _ = self
                    .store
                    .upsert_job_document(job_id, document_id, DocumentStage::Queued, None)
                    .await;
                Ok(())
            }
            Err(e) if is_infrastructure(&e) => Err(e),
            Err(e) => {
                warn!(%document_id, error = %e, "document failed, job continues");
                let message = e.to_string();
                let _ = self
                    .store
                    .set_document_status(document_id, DocumentStatus::Failed, Some(&message))
                    .await;
                let _ = self
                    .store
                    .upsert_job_document(job_id, document_id, DocumentStage::Failed, Some(&message))
                    .await;
                Ok(())
            }
        }
    }

    /// Returns `Ok(false)` when cancellation interrupted the stages.
    async fn run_stages(
        &self,
        job_id: Uuid,
        document_id: Uuid,
        cancelled: &AtomicBool,
    ) -> Result<bool> {
        let stage = |stage: DocumentStage| {
            self.store
                .upsert_job_document(job_id, document_id, stage, None)
        };

        if cancelled.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.store
            .set_document_status(document_id, DocumentStatus::Processing, None)
            .await?;

        // Sampling: pull the raw text back out of blob storage.
        stage(DocumentStage::Sampling).await?;
        let document = self.store.get_document_unchecked(document_id).await?;
        let bytes = self.blobs.read(document.owner_id, document_id).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        if cancelled.load(Ordering::Acquire) {
            return Ok(false);
        }

        // Judging: file-type overrides, then the advisory LLM judge.
        stage(DocumentStage::Judging).await?;
        let recommendation = if self.config.judge.chunking_enabled {
            self.judge.recommend(&document.filename, &text).await
        } else {
            crate::chunking::ChunkingRecommendation::fallback_from(
                &self.config.chunking,
                "disabled",
            )
        };
        self.store
            .set_document_chunking(document_id, &recommendation)
            .await?;
        self.store
            .set_job_strategy_summary(job_id, &recommendation.summary())
            .await?;

        if cancelled.load(Ordering::Acquire) {
            return Ok(false);
        }

        // Splitting.
        stage(DocumentStage::Splitting).await?;
        let params = SplitterParams::new(recommendation.chunk_size, recommendation.chunk_overlap);
        let pieces: Vec<_> =
            run_strategy(recommendation.strategy, &self.llm, text, &params)
                .await?
                .collect();

        // Embedding, in ordered batches with cancellation checks between.
        stage(DocumentStage::Embedding).await?;
        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(pieces.len());
        for batch in pieces.chunks(EMBED_BATCH) {
            if cancelled.load(Ordering::Acquire) {
                return Ok(false);
            }
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let response = self.llm.embed(EmbedRequest::batch(texts)).await?;
            embeddings.extend(response.embeddings);
        }

        if cancelled.load(Ordering::Acquire) {
            return Ok(false);
        }

        // Persisting: chunks transactionally, then the vector batch.
        stage(DocumentStage::Persisting).await?;
        let chunk_snapshot = serde_json::json!({
            "owner_id": document.owner_id.to_string(),
            "visibility": document.visibility.as_str(),
        });
        let new_chunks: Vec<NewChunk> = pieces
            .iter()
            .map(|piece| {
                let mut metadata = piece.metadata.clone();
                if let Some(object) = metadata.as_object_mut() {
                    object.insert("snapshot".to_string(), chunk_snapshot.clone());
                }
                NewChunk {
                    index: piece.index,
                    content: piece.text.clone(),
                    metadata,
                }
            })
            .collect();
        self.store
            .replace_chunks(document_id, document.version, &new_chunks)
            .await?;

        let envelope = self.access.envelope_for(document_id).await?;
        self.vector.delete_document(document_id).await?;
        let entries: Vec<(Uuid, Vec<f32>)> = new_chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                (
                    chunk_id_for(document_id, chunk.index, &chunk.content),
                    embedding,
                )
            })
            .collect();
        self.vector.upsert_batch(&entries, &envelope).await?;

        self.store
            .set_document_status(document_id, DocumentStatus::Complete, None)
            .await?;
        stage(DocumentStage::Done).await?;
        debug!(%document_id, chunks = entries.len(), "document ingested");
        Ok(true)
    }
}

/// Infrastructure faults fail the whole job; everything else is isolated
/// to the document that raised it.
fn is_infrastructure(error: &Error) -> bool {
    matches!(
        error,
        Error::StoreUnavailable(_)
            | Error::LlmTransport(_)
            | Error::ResourceShutdown
            | Error::ResourceExhausted { .. }
    )
}
