use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Why an ingestion happened: user-initiated, system-automatic (file drop,
/// schedule), or discovered pre-existing content in the backend index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IngestionType {
    Manual,
    Auto,
    Existing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    IngestionPending,
    IngestionInProgress,
    IngestionCompleted,
    IngestionFailed,
    DeletePending,
    DeleteInProgress,
    DeleteCompleted,
    DeleteFailed,
}

impl JobStatus {
    /// Legal transitions of the job state machine. The move into an
    /// in-progress state happens before any backend call so a crash leaves
    /// an inspectable job rather than a silently lost one.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (IngestionPending, IngestionInProgress)
                | (IngestionInProgress, IngestionCompleted)
                | (IngestionInProgress, IngestionFailed)
                | (IngestionFailed, IngestionPending)
                | (IngestionCompleted, DeletePending)
                | (DeletePending, DeleteInProgress)
                | (DeleteInProgress, DeleteCompleted)
                | (DeleteInProgress, DeleteFailed)
                | (DeleteFailed, DeletePending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::IngestionCompleted
                | JobStatus::IngestionFailed
                | JobStatus::DeleteCompleted
                | JobStatus::DeleteFailed
        )
    }
}

/// Chunking requested for a job or configured on a collection. Absent
/// size/overlap on the fixed variant fall back to configured defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkStrategy {
    Fixed {
        size: Option<usize>,
        overlap: Option<usize>,
    },
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: String,
    pub repository_id: String,
    pub collection_id: String,
    pub embedding_model: String,
    pub source_paths: Vec<String>,
    pub chunk_strategy: ChunkStrategy,
    pub ingestion_type: IngestionType,
    pub status: JobStatus,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionJob {
    pub fn new(
        repository_id: impl Into<String>,
        collection_id: impl Into<String>,
        embedding_model: impl Into<String>,
        source_paths: Vec<String>,
        chunk_strategy: ChunkStrategy,
        ingestion_type: IngestionType,
        username: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            repository_id: repository_id.into(),
            collection_id: collection_id.into(),
            embedding_model: embedding_model.into(),
            source_paths,
            chunk_strategy,
            ingestion_type,
            status: JobStatus::IngestionPending,
            username: username.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A successfully ingested source and the backend-side chunk ids that belong
/// to it. The `subdocs` set must exactly mirror what exists in the backend
/// index for this document; deletion removes both in the same logical
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagDocument {
    pub document_id: String,
    pub repository_id: String,
    pub collection_id: String,
    pub document_name: String,
    pub source: String,
    pub subdocs: Vec<String>,
    pub chunk_strategy: ChunkStrategy,
    pub username: String,
    pub ingestion_type: IngestionType,
    pub ingested_at: DateTime<Utc>,
}

impl RagDocument {
    pub fn partition_key(&self) -> String {
        derive_partition_key(&self.repository_id, &self.collection_id)
    }
}

/// Deterministic partition key so all documents of a collection are
/// co-located for scans and lists.
pub fn derive_partition_key(repository_id: &str, collection_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repository_id.as_bytes());
    hasher.update(b"#");
    hasher.update(collection_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic document id shared by every backend, so re-ingesting
/// the same source upserts and deletes can be reconstructed from scope
/// plus source alone.
pub fn derive_document_id(repository_id: &str, collection_id: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repository_id.as_bytes());
    hasher.update(b"#");
    hasher.update(collection_id.as_bytes());
    hasher.update(b"#");
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Active,
    DeleteInProgress,
}

/// A named, access-controlled grouping of documents inside a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagCollectionConfig {
    pub collection_id: String,
    pub repository_id: String,
    pub name: String,
    pub allowed_groups: Vec<String>,
    pub created_by: Option<String>,
    pub private: bool,
    pub status: CollectionStatus,
    pub chunk_strategy: Option<ChunkStrategy>,
}

/// Top-level repository configuration binding a backend type and a default
/// embedding model. The `backend` tag is resolved to an adapter at
/// repository-creation time; an unknown tag fails then, not at first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub repository_id: String,
    pub backend: String,
    pub embedding_model: String,
    #[serde(default = "default_true")]
    pub allow_user_collections: bool,
}

fn default_true() -> bool {
    true
}

/// One raw source text handed to the chunker, with whatever metadata the
/// trigger attached. Chunking must carry metadata through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    pub source: String,
    pub text: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A ranked retrieval hit. `score` is normalized to [0, 1] with 1.0 a
/// perfect match, regardless of backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub score: f64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
