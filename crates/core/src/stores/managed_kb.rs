use crate::error::{RagError, Result};
use crate::models::{derive_document_id, IngestionJob, RagDocument, RetrievedChunk};
use crate::objects::ObjectStoreClient;
use crate::traits::{clamp_similarity, RepositoryService};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::info;
use url::Url;

/// Fully managed knowledge-base backend. The service runs its own chunking
/// and indexing pipeline; this adapter stages content plus a side-channel
/// metadata object and triggers a sync, and queries the retrieve API which
/// already returns a [0, 1] relevance score.
pub struct ManagedKbStore {
    client: Client,
    endpoint: String,
    knowledge_base_id: String,
    repository_id: String,
    objects: ObjectStoreClient,
}

impl ManagedKbStore {
    pub fn new(
        endpoint: impl Into<String>,
        knowledge_base_id: impl Into<String>,
        repository_id: impl Into<String>,
        objects: ObjectStoreClient,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            knowledge_base_id: knowledge_base_id.into(),
            repository_id: repository_id.into(),
            objects,
        }
    }

    fn content_key(&self, collection_id: &str, document_name: &str) -> String {
        format!("{}/{}/{}", self.repository_id, collection_id, document_name)
    }

    async fn trigger_sync(&self) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/knowledge-bases/{}/ingestion-jobs",
                self.endpoint, self.knowledge_base_id
            ))
            .json(&json!({}))
            .send()
            .await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(RagError::transient("managed-kb", status.to_string()));
        }
        if !status.is_success() {
            return Err(RagError::BackendResponse {
                backend: "managed-kb".to_string(),
                details: status.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryService for ManagedKbStore {
    fn backend_name(&self) -> &'static str {
        "managed-kb"
    }

    fn supports_custom_collections(&self) -> bool {
        false
    }

    fn should_create_default_collection(&self) -> bool {
        false
    }

    fn normalize_score(&self, raw: f64) -> f64 {
        clamp_similarity(raw)
    }

    fn validate_document_source(&self, path: &str) -> Result<String> {
        // The managed pipeline ingests from object storage only, so the
        // locator must carry a scheme.
        let parsed = Url::parse(path.trim())
            .map_err(|_| RagError::validation("source", "expected a scheme-qualified locator"))?;
        if parsed.scheme() != "s3" && parsed.scheme() != "https" {
            return Err(RagError::validation(
                "source",
                format!("unsupported locator scheme {}", parsed.scheme()),
            ));
        }
        Ok(parsed.to_string())
    }

    async fn ingest_document(
        &self,
        job: &IngestionJob,
        texts: &[String],
        _embeddings: &[Vec<f32>],
        _metadatas: &[Value],
    ) -> Result<RagDocument> {
        let source = job
            .source_paths
            .first()
            .ok_or_else(|| RagError::validation("source_paths", "job has no source"))?;
        let document_name = source.rsplit('/').next().unwrap_or(source).to_string();
        let content_key = self.content_key(&job.collection_id, &document_name);

        // The service chunks and embeds on its side; we stage the raw text.
        let content = texts.join("\n");
        self.objects
            .put_object(&content_key, content.into_bytes())
            .await?;
        self.objects
            .put_metadata(
                &content_key,
                &json!({
                    "metadataAttributes": {
                        "repository_id": &job.repository_id,
                        "collection_id": &job.collection_id,
                        "ingestion_type": job.ingestion_type,
                    }
                }),
            )
            .await?;

        self.trigger_sync().await?;

        Ok(RagDocument {
            document_id: derive_document_id(&job.repository_id, &job.collection_id, source),
            repository_id: job.repository_id.clone(),
            collection_id: job.collection_id.clone(),
            document_name,
            source: source.clone(),
            subdocs: vec![content_key],
            chunk_strategy: job.chunk_strategy,
            username: job.username.clone(),
            ingestion_type: job.ingestion_type,
            ingested_at: Utc::now(),
        })
    }

    async fn delete_document(&self, document: &RagDocument) -> Result<()> {
        for content_key in &document.subdocs {
            // Absent objects are treated as already deleted.
            self.objects.delete_with_metadata(content_key).await?;
        }
        self.trigger_sync().await
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!(
                "{}/knowledge-bases/{}/collections/{}",
                self.endpoint, self.knowledge_base_id, collection_id
            ))
            .send()
            .await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            info!(collection = collection_id, "collection already absent on drop");
            return Ok(());
        }
        if !status.is_success() {
            return Err(RagError::BackendResponse {
                backend: "managed-kb".to_string(),
                details: status.to_string(),
            });
        }
        Ok(())
    }

    async fn retrieve_documents(
        &self,
        _query_vector: &[f32],
        query_text: &str,
        collection_id: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let response = self
            .client
            .post(format!(
                "{}/knowledge-bases/{}/retrieve",
                self.endpoint, self.knowledge_base_id
            ))
            .json(&json!({
                "query": query_text,
                "collection_id": collection_id,
                "top_k": top_k,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RagError::BackendResponse {
                backend: "managed-kb".to_string(),
                details: response.status().to_string(),
            });
        }

        let body: Value = response.json().await?;
        let results = body
            .pointer("/results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut chunks = Vec::new();
        for result in results {
            let raw_score = result
                .pointer("/score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            chunks.push(RetrievedChunk {
                chunk_id: result
                    .pointer("/chunk_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                document_id: result
                    .pointer("/document_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                text: result
                    .pointer("/content/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score: self.normalize_score(raw_score),
                metadata: result
                    .pointer("/metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            });
        }
        Ok(chunks)
    }

    async fn create_default_collection(&self) -> Result<()> {
        // Managed pipeline provisions its own storage; nothing to do here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    fn store() -> ManagedKbStore {
        ManagedKbStore::new(
            "http://localhost:8080",
            "kb-1",
            "repo",
            ObjectStoreClient::new("http://localhost:9000", "rag", RetryPolicy::immediate(1)),
        )
    }

    #[test]
    fn source_must_be_a_scheme_qualified_locator() {
        let store = store();
        assert!(store.validate_document_source("docs/a.txt").is_err());
        assert!(store.validate_document_source("ftp://host/a.txt").is_err());
        assert_eq!(
            store.validate_document_source("s3://bucket/a.txt").unwrap(),
            "s3://bucket/a.txt"
        );
    }

    #[test]
    fn managed_backend_owns_collections() {
        let store = store();
        assert!(!store.supports_custom_collections());
        assert!(!store.should_create_default_collection());
    }

    #[test]
    fn content_keys_nest_repository_and_collection() {
        let store = store();
        assert_eq!(
            store.content_key("coll", "report.txt"),
            "repo/coll/report.txt"
        );
    }
}
