use crate::access::{AccessCacheConfig, CollectionAccessPolicy, Permission, UserContext};
use crate::batch::{plan_batches, BatchLimits};
use crate::chunking::{chunk_documents, ChunkingDefaults};
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::models::{
    ChunkStrategy, CollectionStatus, IngestionJob, IngestionType, JobStatus, RagCollectionConfig,
    RagDocument, RetrievedChunk, SourceDocument,
};
use crate::prefix::{EmbeddingPrefixConfig, TextRole};
use crate::retry::RetryPolicy;
use crate::store::{DirectoryAdmin, DocumentStore};
use crate::stores::{build_repository_service, BackendConnections};
use crate::traits::RepositoryService;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Job-creation parameters handed in by a trigger (file drop, schedule, API).
#[derive(Debug, Clone)]
pub struct IngestionRequest {
    pub repository_id: String,
    pub collection_id: String,
    pub embedding_model: Option<String>,
    pub source_paths: Vec<String>,
    pub chunk_strategy: Option<ChunkStrategy>,
    pub ingestion_type: IngestionType,
    pub username: String,
}

/// Outcome of a continue-past-failure batch operation: both sides are
/// counted and reported, one item's failure never aborts the rest.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

pub struct IngestionEngine<D: DirectoryAdmin + Clone> {
    store: Arc<dyn DocumentStore>,
    directory: D,
    access: CollectionAccessPolicy<D>,
    backends: RwLock<HashMap<String, Arc<dyn RepositoryService>>>,
    embedder: Arc<dyn Embedder>,
    chunk_defaults: ChunkingDefaults,
    limits: BatchLimits,
    retry: RetryPolicy,
    teardown_page_size: usize,
}

impl<D: DirectoryAdmin + Clone> IngestionEngine<D> {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        directory: D,
        embedder: Arc<dyn Embedder>,
        cache: AccessCacheConfig,
    ) -> Self {
        Self {
            store,
            access: CollectionAccessPolicy::new(directory.clone(), cache),
            directory,
            backends: RwLock::new(HashMap::new()),
            embedder,
            chunk_defaults: ChunkingDefaults::default(),
            limits: BatchLimits::default(),
            retry: RetryPolicy::default(),
            teardown_page_size: 100,
        }
    }

    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve and register the adapter for a repository. Runs at
    /// repository-creation time so an unsupported backend tag fails here.
    pub async fn register_repository(
        &self,
        config: crate::models::RepositoryConfig,
        connections: &BackendConnections,
    ) -> Result<()> {
        let service =
            build_repository_service(&config, connections, self.embedder.dimensions())?;
        if service.should_create_default_collection() {
            service.create_default_collection().await?;
        }
        self.backends
            .write()
            .await
            .insert(config.repository_id.clone(), service);
        self.directory.put_repository(config).await?;
        Ok(())
    }

    /// Register an already-constructed adapter (tests, custom wiring).
    pub async fn register_backend(
        &self,
        repository: crate::models::RepositoryConfig,
        service: Arc<dyn RepositoryService>,
    ) -> Result<()> {
        self.backends
            .write()
            .await
            .insert(repository.repository_id.clone(), service);
        self.directory.put_repository(repository).await?;
        Ok(())
    }

    async fn backend(&self, repository_id: &str) -> Result<Arc<dyn RepositoryService>> {
        self.backends
            .read()
            .await
            .get(repository_id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(format!("repository {repository_id}")))
    }

    pub fn access_policy(&self) -> &CollectionAccessPolicy<D> {
        &self.access
    }

    /// Create a collection inside a repository, honoring the backend's
    /// custom-collection capability and the repository-level flag.
    pub async fn create_collection(
        &self,
        user: &UserContext,
        collection: RagCollectionConfig,
    ) -> Result<()> {
        let repository = self
            .directory
            .repository(&collection.repository_id)
            .await?
            .ok_or_else(|| {
                RagError::NotFound(format!("repository {}", collection.repository_id))
            })?;
        let service = self.backend(&collection.repository_id).await?;

        if !service.supports_custom_collections() {
            return Err(RagError::Configuration(format!(
                "backend {} does not support custom collections",
                service.backend_name()
            )));
        }
        if !user.is_admin && !repository.allow_user_collections {
            return Err(RagError::NotAuthorized);
        }

        // Re-creating an existing collection can change its groups or
        // visibility, so cached decisions for it must not outlive the write.
        let collection_id = collection.collection_id.clone();
        self.directory.put_collection(collection).await?;
        self.access.invalidate_collection(&collection_id);
        Ok(())
    }

    /// Persist a pending job for a trigger request. Validation happens here
    /// so a bad source fails synchronously, before anything is queued.
    pub async fn create_job(&self, request: IngestionRequest) -> Result<IngestionJob> {
        let repository = self
            .directory
            .repository(&request.repository_id)
            .await?
            .ok_or_else(|| {
                RagError::NotFound(format!("repository {}", request.repository_id))
            })?;
        let service = self.backend(&request.repository_id).await?;

        if request.source_paths.is_empty() {
            return Err(RagError::validation("source_paths", "at least one source required"));
        }
        let mut sources = Vec::with_capacity(request.source_paths.len());
        for path in &request.source_paths {
            sources.push(service.validate_document_source(path)?);
        }

        let chunk_strategy = match request.chunk_strategy {
            Some(strategy) => strategy,
            None => {
                let collection = self.directory.collection(&request.collection_id).await?;
                collection
                    .and_then(|collection| collection.chunk_strategy)
                    .unwrap_or(ChunkStrategy::Fixed {
                        size: None,
                        overlap: None,
                    })
            }
        };

        let job = IngestionJob::new(
            request.repository_id,
            request.collection_id,
            request
                .embedding_model
                .unwrap_or(repository.embedding_model),
            sources,
            chunk_strategy,
            request.ingestion_type,
            request.username,
        );
        self.store.put_job(job.clone()).await?;
        Ok(job)
    }

    /// Execute an ingestion job against extracted source documents. The
    /// in-progress transition happens before any backend call; any failure
    /// marks the job failed and re-raises.
    pub async fn run_ingestion(
        &self,
        job_id: &str,
        documents: Vec<SourceDocument>,
    ) -> Result<RagDocument> {
        let claimed = self
            .store
            .transition_job(job_id, JobStatus::IngestionPending, JobStatus::IngestionInProgress)
            .await?;
        let Some(job) = claimed else {
            // Lost the conditional write: a concurrent trigger owns this job.
            return Err(RagError::Integrity(format!(
                "job {job_id} is already being executed"
            )));
        };

        match self.ingest_inner(&job, documents).await {
            Ok(document) => {
                self.store
                    .transition_job(
                        job_id,
                        JobStatus::IngestionInProgress,
                        JobStatus::IngestionCompleted,
                    )
                    .await?;
                info!(job = job_id, document = %document.document_id, "ingestion completed");
                Ok(document)
            }
            Err(error) => {
                warn!(job = job_id, %error, "ingestion failed");
                if let Err(transition_error) = self
                    .store
                    .transition_job(
                        job_id,
                        JobStatus::IngestionInProgress,
                        JobStatus::IngestionFailed,
                    )
                    .await
                {
                    warn!(job = job_id, %transition_error, "could not mark job failed");
                }
                Err(error)
            }
        }
    }

    async fn ingest_inner(
        &self,
        job: &IngestionJob,
        documents: Vec<SourceDocument>,
    ) -> Result<RagDocument> {
        let service = self.backend(&job.repository_id).await?;
        let chunks = chunk_documents(documents, job.chunk_strategy, self.chunk_defaults)?;
        if chunks.is_empty() {
            return Err(RagError::validation("documents", "nothing to ingest"));
        }

        let prefix = EmbeddingPrefixConfig::for_model(&job.embedding_model);
        let raw_texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let embed_texts: Vec<String> = match &prefix {
            Some(config) => raw_texts
                .iter()
                .map(|text| config.resolve_document_text(text))
                .collect(),
            None => raw_texts.clone(),
        };

        let embeddings = self.embed_adaptive(&embed_texts, TextRole::Document).await?;

        let metadatas: Vec<Value> = chunks
            .iter()
            .map(|chunk| {
                let mut metadata = chunk.metadata.clone();
                metadata.insert("source".to_string(), Value::String(chunk.source.clone()));
                metadata.insert(
                    "repository_id".to_string(),
                    Value::String(job.repository_id.clone()),
                );
                metadata.insert(
                    "collection_id".to_string(),
                    Value::String(job.collection_id.clone()),
                );
                Value::Object(metadata)
            })
            .collect();

        let document = self
            .retry
            .run("backend ingest", || {
                let service = service.clone();
                let raw_texts = raw_texts.clone();
                let embeddings = embeddings.clone();
                let metadatas = metadatas.clone();
                async move {
                    service
                        .ingest_document(job, &raw_texts, &embeddings, &metadatas)
                        .await
                }
            })
            .await?;

        self.store.put_document(document.clone()).await?;
        Ok(document)
    }

    /// Embed all texts, grouping by the adaptive batch plan. A transient
    /// failure halves the batch and retries each half; slots already filled
    /// by a succeeded half are never re-submitted. Oversized items run as
    /// singleton batches with their own retry.
    async fn embed_adaptive(&self, texts: &[String], role: TextRole) -> Result<Vec<Vec<f32>>> {
        let plan = plan_batches(texts, self.limits);
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        for batch in &plan.batches {
            self.embed_indices(texts, batch, role, &mut slots).await?;
        }
        for index in &plan.oversized {
            warn!(index, "item exceeds per-item token cap, submitting individually");
            self.embed_indices(texts, std::slice::from_ref(index), role, &mut slots)
                .await?;
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| RagError::Integrity("embedding slot left unfilled".into()))
            })
            .collect()
    }

    fn embed_indices<'a>(
        &'a self,
        texts: &'a [String],
        indices: &'a [usize],
        role: TextRole,
        slots: &'a mut Vec<Option<Vec<f32>>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let batch: Vec<String> = indices.iter().map(|index| texts[*index].clone()).collect();

            if indices.len() == 1 {
                let vectors = self
                    .retry
                    .run("embed single", || {
                        let batch = batch.clone();
                        let embedder = self.embedder.clone();
                        async move { embedder.embed(&batch, role).await }
                    })
                    .await?;
                slots[indices[0]] = vectors.into_iter().next();
                return Ok(());
            }

            match self.embedder.embed(&batch, role).await {
                Ok(vectors) => {
                    if vectors.len() != indices.len() {
                        return Err(RagError::Integrity(format!(
                            "embedder returned {} vectors for {} texts",
                            vectors.len(),
                            indices.len()
                        )));
                    }
                    for (index, vector) in indices.iter().zip(vectors) {
                        slots[*index] = Some(vector);
                    }
                    Ok(())
                }
                Err(error) if error.is_transient() => {
                    let mid = indices.len() / 2;
                    warn!(
                        batch_len = indices.len(),
                        %error,
                        "oversized or throttled request, halving batch"
                    );
                    self.embed_indices(texts, &indices[..mid], role, slots).await?;
                    self.embed_indices(texts, &indices[mid..], role, slots).await?;
                    Ok(())
                }
                Err(error) => Err(error),
            }
        })
    }

    /// Delete one ingested document. Looks up (or synthesizes) the tracking
    /// job so deletion always runs under the state machine, removes backend
    /// vectors and the provenance record in the same logical operation.
    pub async fn run_deletion(
        &self,
        repository_id: &str,
        collection_id: &str,
        document_id: &str,
    ) -> Result<()> {
        let document = self
            .store
            .get_document(repository_id, collection_id, document_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("document {document_id}")))?;

        let job_id = match self
            .store
            .find_job_for_source(repository_id, collection_id, &document.source)
            .await?
        {
            Some(job) if job.status == JobStatus::IngestionCompleted => {
                let claimed = self
                    .store
                    .transition_job(&job.job_id, JobStatus::IngestionCompleted, JobStatus::DeletePending)
                    .await?;
                if claimed.is_none() {
                    return Err(RagError::Integrity(format!(
                        "job {} is already being deleted",
                        job.job_id
                    )));
                }
                job.job_id
            }
            Some(job) if job.status == JobStatus::DeletePending => job.job_id,
            Some(job) if job.status == JobStatus::DeleteFailed => {
                let reopened = self
                    .store
                    .transition_job(&job.job_id, JobStatus::DeleteFailed, JobStatus::DeletePending)
                    .await?;
                if reopened.is_none() {
                    return Err(RagError::Integrity(format!(
                        "job {} is already being retried",
                        job.job_id
                    )));
                }
                job.job_id
            }
            Some(job) => {
                return Err(RagError::Integrity(format!(
                    "job {} is in state {:?}, cannot delete",
                    job.job_id, job.status
                )));
            }
            // Legacy or externally added content: backfill a tracking job.
            // The deterministic id makes concurrent backfills collapse onto
            // one record, so the conditional transition below arbitrates.
            None => {
                let synthetic_id = format!("delete-{document_id}");
                if self.store.get_job(&synthetic_id).await?.is_none() {
                    let mut job = IngestionJob::new(
                        repository_id,
                        collection_id,
                        "unknown",
                        vec![document.source.clone()],
                        document.chunk_strategy,
                        IngestionType::Existing,
                        document.username.clone(),
                    );
                    job.job_id = synthetic_id.clone();
                    job.status = JobStatus::DeletePending;
                    self.store.put_job(job).await?;
                }
                synthetic_id
            }
        };

        let claimed = self
            .store
            .transition_job(&job_id, JobStatus::DeletePending, JobStatus::DeleteInProgress)
            .await?;
        if claimed.is_none() {
            return Err(RagError::Integrity(format!(
                "job {job_id} is already being executed"
            )));
        }

        let service = self.backend(repository_id).await?;
        let outcome: Result<()> = async {
            self.retry
                .run("backend delete", || {
                    let service = service.clone();
                    let document = document.clone();
                    async move { service.delete_document(&document).await }
                })
                .await?;
            self.store
                .delete_document(repository_id, collection_id, document_id)
                .await
        }
        .await;

        match outcome {
            Ok(()) => {
                self.store
                    .transition_job(&job_id, JobStatus::DeleteInProgress, JobStatus::DeleteCompleted)
                    .await?;
                info!(job = %job_id, document = document_id, "deletion completed");
                Ok(())
            }
            Err(error) => {
                warn!(job = %job_id, %error, "deletion failed");
                if let Err(transition_error) = self
                    .store
                    .transition_job(&job_id, JobStatus::DeleteInProgress, JobStatus::DeleteFailed)
                    .await
                {
                    warn!(job = %job_id, %transition_error, "could not mark job failed");
                }
                Err(error)
            }
        }
    }

    /// Access-gated similarity search. The cached collection check runs
    /// before anything touches the backend.
    pub async fn retrieve(
        &self,
        user: &UserContext,
        collection_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let decision = self
            .access
            .check_collection_permission(user, collection_id, Permission::Read)
            .await;
        if !decision.allowed {
            if decision.reason == "not found" {
                return Err(RagError::NotFound(format!("collection {collection_id}")));
            }
            return Err(RagError::NotAuthorized);
        }

        let collection = self
            .directory
            .collection(collection_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("collection {collection_id}")))?;
        let repository = self
            .directory
            .repository(&collection.repository_id)
            .await?
            .ok_or_else(|| {
                RagError::NotFound(format!("repository {}", collection.repository_id))
            })?;
        let service = self.backend(&collection.repository_id).await?;

        let prefix = EmbeddingPrefixConfig::for_model(&repository.embedding_model);
        let query_text = match &prefix {
            Some(config) => config.resolve_query_text(query),
            None => query.to_string(),
        };
        let vectors = self
            .embedder
            .embed(&[query_text.clone()], TextRole::Query)
            .await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Integrity("embedder returned no query vector".into()))?;

        service
            .retrieve_documents(&query_vector, &query_text, collection_id, top_k)
            .await
    }

    /// Tear down a collection: delete every document (continuing past
    /// individual failures), drop the backend-side collection state (failure
    /// logged and swallowed, re-invocation retries it), and remove the
    /// collection record only once everything else is gone.
    pub async fn teardown_collection(
        &self,
        repository_id: &str,
        collection_id: &str,
    ) -> Result<BatchOutcome> {
        self.directory
            .set_collection_status(collection_id, CollectionStatus::DeleteInProgress)
            .await?;

        let mut outcome = BatchOutcome::default();
        let mut cursor = None;
        loop {
            let page = self
                .store
                .list_documents(repository_id, collection_id, cursor, self.teardown_page_size)
                .await?;
            for document in &page.items {
                match self
                    .run_deletion(repository_id, collection_id, &document.document_id)
                    .await
                {
                    Ok(()) => outcome.succeeded += 1,
                    Err(error) => {
                        outcome.failed += 1;
                        outcome
                            .errors
                            .push(format!("{}: {error}", document.document_id));
                    }
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Re-drive any deletions still pending from earlier, failed runs.
        let mut cursor = None;
        loop {
            let page = self
                .store
                .find_pending_deletes(repository_id, cursor, self.teardown_page_size)
                .await?;
            for job in &page.items {
                if job.collection_id != collection_id {
                    continue;
                }
                for source in &job.source_paths {
                    let document_id =
                        crate::models::derive_document_id(repository_id, collection_id, source);
                    match self
                        .run_deletion(repository_id, collection_id, &document_id)
                        .await
                    {
                        Ok(()) => outcome.succeeded += 1,
                        Err(RagError::NotFound(_)) => {}
                        Err(error) => {
                            outcome.failed += 1;
                            outcome.errors.push(format!("{document_id}: {error}"));
                        }
                    }
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if outcome.failed > 0 {
            warn!(
                collection = collection_id,
                failed = outcome.failed,
                "teardown left documents behind, collection kept for retry"
            );
            return Ok(outcome);
        }

        let service = self.backend(repository_id).await?;
        // Index-drop failure must not block collection metadata deletion;
        // re-invoking teardown retries the drop.
        if let Err(error) = service.delete_collection(collection_id).await {
            warn!(collection = collection_id, %error, "backend collection drop failed");
        }

        self.directory.remove_collection(collection_id).await?;
        self.access.invalidate_collection(collection_id);
        Ok(outcome)
    }
}
