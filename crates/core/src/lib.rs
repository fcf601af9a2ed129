pub mod access;
pub mod batch;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod models;
pub mod objects;
pub mod orchestrator;
pub mod prefix;
pub mod retry;
pub mod store;
pub mod stores;
pub mod traits;

pub use access::{
    evaluate_access, AccessCacheConfig, AccessDecision, CachedAccessControlService,
    CollectionAccessPolicy, CollectionDirectory, Permission, ResourceContext, UserContext,
};
pub use batch::{estimate_tokens, plan_batches, BatchLimits, BatchPlan};
pub use chunking::{chunk_documents, ChunkingDefaults, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use embeddings::{Embedder, HashEmbedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{RagError, Result};
pub use models::{
    derive_document_id, derive_partition_key, ChunkStrategy, CollectionStatus, IngestionJob,
    IngestionType, JobStatus,
    RagCollectionConfig, RagDocument, RepositoryConfig, RetrievedChunk, SourceDocument,
};
pub use orchestrator::{BatchOutcome, IngestionEngine, IngestionRequest};
pub use prefix::{EmbeddingPrefixConfig, PrefixMode, TextRole};
pub use retry::RetryPolicy;
pub use store::{
    DirectoryAdmin, DocumentStore, DirectorySnapshot, MemoryDirectory, MemoryDocumentStore, Page,
    StoreSnapshot,
};
pub use stores::{
    build_repository_service, connect_postgres_lazy, BackendConnections, ManagedKbStore,
    OpenSearchStore, PgVectorStore, RepositoryBackend,
};
pub use traits::{normalize_cosine_distance, RepositoryService};
