use crate::error::Result;
use crate::models::{IngestionJob, RagDocument, RetrievedChunk};
use async_trait::async_trait;
use serde_json::Value;

/// Capability contract implemented once per backend family. The factory in
/// `stores` resolves a repository's declared backend tag to one of these.
#[async_trait]
pub trait RepositoryService: Send + Sync {
    /// Human-readable backend family name, used in logs and error messages.
    fn backend_name(&self) -> &'static str;

    /// Whether users may create their own collections in this backend.
    fn supports_custom_collections(&self) -> bool;

    /// Whether a default collection should be provisioned with the repository.
    fn should_create_default_collection(&self) -> bool;

    /// Map a raw backend score onto [0, 1] where 1.0 is a perfect match.
    /// Similarity backends clamp and pass through; distance backends invert.
    fn normalize_score(&self, raw: f64) -> f64;

    /// Reject source locators this backend cannot ingest; returns the
    /// (possibly canonicalized) path on success.
    fn validate_document_source(&self, path: &str) -> Result<String>;

    /// Write chunk vectors for one job and return the resulting document
    /// record, `subdocs` holding the backend-assigned chunk ids in order.
    async fn ingest_document(
        &self,
        job: &IngestionJob,
        texts: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[Value],
    ) -> Result<RagDocument>;

    /// Remove every indexed chunk belonging to the document.
    async fn delete_document(&self, document: &RagDocument) -> Result<()>;

    /// Drop the backend-side collection state. Idempotent: an absent
    /// index/table is success, not an error.
    async fn delete_collection(&self, collection_id: &str) -> Result<()>;

    async fn retrieve_documents(
        &self,
        query_vector: &[f32],
        query_text: &str,
        collection_id: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>>;

    async fn create_default_collection(&self) -> Result<()>;
}

/// Cosine-distance normalizer shared by distance-returning backends:
/// `similarity = 1 - d/2`, clamped so numerically negative or >2 distances
/// stay inside [0, 1].
pub fn normalize_cosine_distance(distance: f64) -> f64 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Pass-through for similarity-returning backends, clamped defensively.
pub fn clamp_similarity(similarity: f64) -> f64 {
    similarity.clamp(0.0, 1.0)
}
