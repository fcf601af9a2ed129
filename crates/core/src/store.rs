use crate::access::CollectionDirectory;
use crate::error::{RagError, Result};
use crate::models::{
    derive_partition_key, CollectionStatus, IngestionJob, JobStatus, RagCollectionConfig,
    RagDocument, RepositoryConfig,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A page of results plus the cursor to resume from, or `None` when the scan
/// is exhausted. Scans are bounded and restartable, never one unbounded call.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Persistence for job provenance and document records. Jobs are an audit
/// trail and are never deleted; documents live exactly as long as their
/// indexed vectors.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put_job(&self, job: IngestionJob) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<IngestionJob>>;

    /// Conditional status transition: succeeds only when the stored status
    /// still equals `expected`, guaranteeing at-most-one active execution per
    /// job under duplicate triggers. Returns `None` when the condition fails.
    async fn transition_job(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<Option<IngestionJob>>;

    /// Most recent job that ingested the given source into the collection.
    async fn find_job_for_source(
        &self,
        repository_id: &str,
        collection_id: &str,
        source: &str,
    ) -> Result<Option<IngestionJob>>;

    /// Pending-delete jobs for a repository, paginated for the collection
    /// teardown workflow.
    async fn find_pending_deletes(
        &self,
        repository_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<Page<IngestionJob>>;

    async fn put_document(&self, document: RagDocument) -> Result<()>;

    async fn get_document(
        &self,
        repository_id: &str,
        collection_id: &str,
        document_id: &str,
    ) -> Result<Option<RagDocument>>;

    /// Secondary lookup by document id alone. More than one match is a
    /// data-integrity error, never silently resolved.
    async fn find_document_by_id(&self, document_id: &str) -> Result<Option<RagDocument>>;

    async fn delete_document(
        &self,
        repository_id: &str,
        collection_id: &str,
        document_id: &str,
    ) -> Result<()>;

    async fn list_documents(
        &self,
        repository_id: &str,
        collection_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<Page<RagDocument>>;
}

#[derive(Default)]
struct StoreInner {
    jobs: BTreeMap<String, IngestionJob>,
    // Keyed (partition_key, document_id) so a collection's documents are
    // co-located for range scans.
    documents: BTreeMap<(String, String), RagDocument>,
}

/// In-process store over `tokio::sync::RwLock`. The trait is the seam for a
/// durable implementation; this one backs tests and single-node runs.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: RwLock<StoreInner>,
}

/// Serializable dump of the tracking state, used by single-node runs to
/// persist jobs and documents between invocations.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreSnapshot {
    pub jobs: Vec<IngestionJob>,
    pub documents: Vec<RagDocument>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read().await;
        StoreSnapshot {
            jobs: inner.jobs.values().cloned().collect(),
            documents: inner.documents.values().cloned().collect(),
        }
    }

    pub async fn restore(&self, snapshot: StoreSnapshot) {
        let mut inner = self.inner.write().await;
        inner.jobs = snapshot
            .jobs
            .into_iter()
            .map(|job| (job.job_id.clone(), job))
            .collect();
        inner.documents = snapshot
            .documents
            .into_iter()
            .map(|document| {
                (
                    (document.partition_key(), document.document_id.clone()),
                    document,
                )
            })
            .collect();
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put_job(&self, job: IngestionJob) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<IngestionJob>> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn transition_job(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<Option<IngestionJob>> {
        if !expected.can_transition_to(next) {
            return Err(RagError::validation(
                "status",
                format!("illegal transition {expected:?} -> {next:?}"),
            ));
        }

        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RagError::NotFound(format!("job {job_id}")))?;

        if job.status != expected {
            return Ok(None);
        }
        job.status = next;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn find_job_for_source(
        &self,
        repository_id: &str,
        collection_id: &str,
        source: &str,
    ) -> Result<Option<IngestionJob>> {
        let inner = self.inner.read().await;
        let found = inner
            .jobs
            .values()
            .filter(|job| {
                job.repository_id == repository_id
                    && job.collection_id == collection_id
                    && job.source_paths.iter().any(|path| path == source)
            })
            .max_by_key(|job| job.created_at);
        Ok(found.cloned())
    }

    async fn find_pending_deletes(
        &self,
        repository_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<Page<IngestionJob>> {
        let inner = self.inner.read().await;
        let mut items = Vec::new();
        let mut next_cursor = None;

        for (job_id, job) in inner.jobs.iter() {
            if let Some(after) = &cursor {
                if job_id <= after {
                    continue;
                }
            }
            if job.repository_id != repository_id || job.status != JobStatus::DeletePending {
                continue;
            }
            if items.len() == limit {
                next_cursor = items.last().map(|job: &IngestionJob| job.job_id.clone());
                break;
            }
            items.push(job.clone());
        }

        Ok(Page { items, next_cursor })
    }

    async fn put_document(&self, document: RagDocument) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (document.partition_key(), document.document_id.clone());
        inner.documents.insert(key, document);
        Ok(())
    }

    async fn get_document(
        &self,
        repository_id: &str,
        collection_id: &str,
        document_id: &str,
    ) -> Result<Option<RagDocument>> {
        let inner = self.inner.read().await;
        let key = (
            derive_partition_key(repository_id, collection_id),
            document_id.to_string(),
        );
        Ok(inner.documents.get(&key).cloned())
    }

    async fn find_document_by_id(&self, document_id: &str) -> Result<Option<RagDocument>> {
        let inner = self.inner.read().await;
        let mut matches = inner
            .documents
            .values()
            .filter(|document| document.document_id == document_id);

        let first = matches.next().cloned();
        if first.is_some() && matches.next().is_some() {
            return Err(RagError::Integrity(format!(
                "document id {document_id} resolves to more than one record"
            )));
        }
        Ok(first)
    }

    async fn delete_document(
        &self,
        repository_id: &str,
        collection_id: &str,
        document_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (
            derive_partition_key(repository_id, collection_id),
            document_id.to_string(),
        );
        inner.documents.remove(&key);
        Ok(())
    }

    async fn list_documents(
        &self,
        repository_id: &str,
        collection_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<Page<RagDocument>> {
        let inner = self.inner.read().await;
        let partition = derive_partition_key(repository_id, collection_id);

        let start = match &cursor {
            Some(after) => Bound::Excluded((partition.clone(), after.clone())),
            None => Bound::Included((partition.clone(), String::new())),
        };
        let end = Bound::Unbounded;

        let mut items = Vec::new();
        let mut next_cursor = None;
        for ((part, _), document) in inner.documents.range((start, end)) {
            if part != &partition {
                break;
            }
            if items.len() == limit {
                next_cursor = items.last().map(|doc: &RagDocument| doc.document_id.clone());
                break;
            }
            items.push(document.clone());
        }

        Ok(Page { items, next_cursor })
    }
}

/// Mutating side of the collection/repository registry, used by the engine
/// for repository registration and collection lifecycle.
#[async_trait]
pub trait DirectoryAdmin: CollectionDirectory {
    async fn put_repository(&self, repository: RepositoryConfig) -> Result<()>;
    async fn put_collection(&self, collection: RagCollectionConfig) -> Result<()>;
    async fn set_collection_status(
        &self,
        collection_id: &str,
        status: CollectionStatus,
    ) -> Result<()>;
    async fn remove_collection(&self, collection_id: &str) -> Result<()>;
}

#[derive(Default)]
struct DirectoryInner {
    repositories: HashMap<String, RepositoryConfig>,
    collections: HashMap<String, RagCollectionConfig>,
}

/// In-process registry of repositories and collections, shared behind an
/// `Arc` so the access policy and the engine observe the same state.
#[derive(Default, Clone)]
pub struct MemoryDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

/// Serializable dump of the registry, persisted alongside [`StoreSnapshot`].
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct DirectorySnapshot {
    pub repositories: Vec<RepositoryConfig>,
    pub collections: Vec<RagCollectionConfig>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> DirectorySnapshot {
        let inner = self.inner.read().await;
        DirectorySnapshot {
            repositories: inner.repositories.values().cloned().collect(),
            collections: inner.collections.values().cloned().collect(),
        }
    }

    pub async fn restore(&self, snapshot: DirectorySnapshot) {
        let mut inner = self.inner.write().await;
        inner.repositories = snapshot
            .repositories
            .into_iter()
            .map(|repository| (repository.repository_id.clone(), repository))
            .collect();
        inner.collections = snapshot
            .collections
            .into_iter()
            .map(|collection| (collection.collection_id.clone(), collection))
            .collect();
    }
}

#[async_trait]
impl DirectoryAdmin for MemoryDirectory {
    async fn put_repository(&self, repository: RepositoryConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .repositories
            .insert(repository.repository_id.clone(), repository);
        Ok(())
    }

    async fn put_collection(&self, collection: RagCollectionConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .collections
            .insert(collection.collection_id.clone(), collection);
        Ok(())
    }

    async fn set_collection_status(
        &self,
        collection_id: &str,
        status: CollectionStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let collection = inner
            .collections
            .get_mut(collection_id)
            .ok_or_else(|| RagError::NotFound(format!("collection {collection_id}")))?;
        collection.status = status;
        Ok(())
    }

    async fn remove_collection(&self, collection_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.collections.remove(collection_id);
        Ok(())
    }
}

#[async_trait]
impl CollectionDirectory for MemoryDirectory {
    async fn collection(&self, collection_id: &str) -> Result<Option<RagCollectionConfig>> {
        let inner = self.inner.read().await;
        Ok(inner.collections.get(collection_id).cloned())
    }

    async fn repository(&self, repository_id: &str) -> Result<Option<RepositoryConfig>> {
        let inner = self.inner.read().await;
        Ok(inner.repositories.get(repository_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkStrategy, IngestionType};

    fn job(repository: &str, collection: &str, source: &str) -> IngestionJob {
        IngestionJob::new(
            repository,
            collection,
            "e5-large",
            vec![source.to_string()],
            ChunkStrategy::None,
            IngestionType::Manual,
            "alice",
        )
    }

    fn document(repository: &str, collection: &str, id: &str) -> RagDocument {
        RagDocument {
            document_id: id.to_string(),
            repository_id: repository.to_string(),
            collection_id: collection.to_string(),
            document_name: format!("{id}.txt"),
            source: format!("s3://bucket/{id}.txt"),
            subdocs: vec![format!("{id}-0"), format!("{id}-1")],
            chunk_strategy: ChunkStrategy::None,
            username: "alice".to_string(),
            ingestion_type: IngestionType::Manual,
            ingested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn conditional_transition_refuses_a_stale_expectation() {
        let store = MemoryDocumentStore::new();
        let job = job("repo", "coll", "a.txt");
        let job_id = job.job_id.clone();
        store.put_job(job).await.unwrap();

        let taken = store
            .transition_job(&job_id, JobStatus::IngestionPending, JobStatus::IngestionInProgress)
            .await
            .unwrap();
        assert!(taken.is_some());

        // A duplicate trigger loses the race.
        let lost = store
            .transition_job(&job_id, JobStatus::IngestionPending, JobStatus::IngestionInProgress)
            .await
            .unwrap();
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected_outright() {
        let store = MemoryDocumentStore::new();
        let job = job("repo", "coll", "a.txt");
        let job_id = job.job_id.clone();
        store.put_job(job).await.unwrap();

        let error = store
            .transition_job(&job_id, JobStatus::IngestionPending, JobStatus::DeleteCompleted)
            .await
            .unwrap_err();
        assert!(matches!(error, RagError::Validation { .. }));
    }

    #[tokio::test]
    async fn duplicate_document_ids_are_an_integrity_error() {
        let store = MemoryDocumentStore::new();
        store.put_document(document("repo", "coll-1", "doc")).await.unwrap();
        store.put_document(document("repo", "coll-2", "doc")).await.unwrap();

        let error = store.find_document_by_id("doc").await.unwrap_err();
        assert!(matches!(error, RagError::Integrity(_)));
    }

    #[tokio::test]
    async fn list_documents_pages_through_a_collection() {
        let store = MemoryDocumentStore::new();
        for index in 0..5 {
            store
                .put_document(document("repo", "coll", &format!("doc-{index}")))
                .await
                .unwrap();
        }
        store.put_document(document("repo", "other", "doc-9")).await.unwrap();

        let first = store.list_documents("repo", "coll", None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.expect("more pages");

        let mut seen: Vec<String> = first
            .items
            .iter()
            .map(|doc| doc.document_id.clone())
            .collect();
        let mut cursor = Some(cursor);
        while let Some(current) = cursor {
            let page = store
                .list_documents("repo", "coll", Some(current), 2)
                .await
                .unwrap();
            seen.extend(page.items.iter().map(|doc| doc.document_id.clone()));
            cursor = page.next_cursor;
        }

        assert_eq!(seen.len(), 5);
        assert!(!seen.contains(&"doc-9".to_string()));
    }

    #[tokio::test]
    async fn pending_deletes_scan_is_scoped_and_paginated() {
        let store = MemoryDocumentStore::new();
        for index in 0..3 {
            let mut pending = job("repo", "coll", &format!("{index}.txt"));
            pending.status = JobStatus::DeletePending;
            store.put_job(pending).await.unwrap();
        }
        store.put_job(job("repo", "coll", "active.txt")).await.unwrap();
        let mut foreign = job("other-repo", "coll", "x.txt");
        foreign.status = JobStatus::DeletePending;
        store.put_job(foreign).await.unwrap();

        let mut total = 0;
        let mut cursor = None;
        loop {
            let page = store
                .find_pending_deletes("repo", cursor, 2)
                .await
                .unwrap();
            total += page.items.len();
            assert!(page.items.iter().all(|job| job.repository_id == "repo"));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn latest_job_for_source_wins() {
        let store = MemoryDocumentStore::new();
        let older = job("repo", "coll", "a.txt");
        let older_id = older.job_id.clone();
        store.put_job(older).await.unwrap();

        let mut newer = job("repo", "coll", "a.txt");
        newer.created_at = Utc::now() + chrono::Duration::seconds(5);
        let newer_id = newer.job_id.clone();
        store.put_job(newer).await.unwrap();

        let found = store
            .find_job_for_source("repo", "coll", "a.txt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.job_id, newer_id);
        assert_ne!(found.job_id, older_id);
    }
}
