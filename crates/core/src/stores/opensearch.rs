use crate::error::{RagError, Result};
use crate::models::{derive_document_id, IngestionJob, RagDocument, RetrievedChunk};
use crate::traits::{clamp_similarity, RepositoryService};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{info, warn};

pub const DEFAULT_COLLECTION_ID: &str = "default";

const BULK_ATTEMPTS: usize = 3;

/// Self-hosted OpenSearch-style backend: one knn index per collection,
/// native similarity scores passed through.
pub struct OpenSearchStore {
    client: Client,
    endpoint: String,
    repository_id: String,
    dimensions: usize,
}

impl OpenSearchStore {
    pub fn new(
        endpoint: impl Into<String>,
        repository_id: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            repository_id: repository_id.into(),
            dimensions,
        }
    }

    fn index_name(&self, collection_id: &str) -> String {
        format!("{}-{}", self.repository_id, collection_id).to_lowercase()
    }

    async fn ensure_index(&self, collection_id: &str) -> Result<()> {
        let index = self.index_name(collection_id);
        let response = self
            .client
            .head(format!("{}/{}", self.endpoint, index))
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }
        if !response.status().is_client_error() {
            return Err(RagError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        let response = self
            .client
            .put(format!("{}/{}", self.endpoint, index))
            .json(&json!({
                "settings": {
                    "index": { "knn": true },
                    "number_of_shards": 1,
                    "number_of_replicas": 0
                },
                "mappings": {
                    "properties": {
                        "document_id": {"type": "keyword"},
                        "source": {"type": "keyword"},
                        "text": {"type": "text"},
                        "metadata": {"type": "object", "enabled": false},
                        "vector": {
                            "type": "knn_vector",
                            "dimension": self.dimensions
                        }
                    }
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RagError::BackendResponse {
                backend: "opensearch".to_string(),
                details: format!("index setup failed with {}", response.status()),
            });
        }
        Ok(())
    }

    async fn bulk(&self, payload: String) -> Result<BulkReport> {
        let response = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()
            .await?;
        let status = response.status();

        if status == StatusCode::PAYLOAD_TOO_LARGE || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RagError::transient("opensearch", status.to_string()));
        }
        if !status.is_success() {
            return Err(RagError::BackendResponse {
                backend: "opensearch".to_string(),
                details: status.to_string(),
            });
        }

        let body: Value = response.json().await?;
        Ok(bulk_item_report(&body))
    }

    /// Partial bulk failures resubmit only the rejected item ids; items the
    /// backend already acknowledged are never sent a second time.
    async fn bulk_until_acknowledged(
        &self,
        mut pending: Vec<(String, String)>,
        operation: &str,
    ) -> Result<()> {
        for attempt in 1..=BULK_ATTEMPTS {
            let payload: String = pending.iter().map(|(_, lines)| lines.as_str()).collect();
            let report = self.bulk(payload).await?;
            if report.failed_ids.is_empty() && report.unidentified_failures == 0 {
                return Ok(());
            }
            if report.unidentified_failures > 0 {
                return Err(RagError::transient(
                    "opensearch",
                    format!(
                        "bulk {operation} rejected {} items without ids",
                        report.unidentified_failures
                    ),
                ));
            }
            let acknowledged = report.succeeded;
            retain_rejected(&mut pending, report.failed_ids);
            if pending.is_empty() {
                return Err(RagError::transient(
                    "opensearch",
                    format!("bulk {operation} rejected ids that were never submitted"),
                ));
            }
            warn!(
                operation,
                attempt,
                acknowledged,
                rejected = pending.len(),
                "bulk items rejected, resubmitting only those"
            );
        }
        Err(RagError::transient(
            "opensearch",
            format!(
                "bulk {operation} kept rejecting {} items after {BULK_ATTEMPTS} rounds",
                pending.len()
            ),
        ))
    }
}

struct BulkReport {
    succeeded: usize,
    failed_ids: Vec<String>,
    unidentified_failures: usize,
}

/// Bulk responses succeed at the HTTP level even when individual items fail;
/// collect the rejected ids instead of aborting on the first. A 404 on
/// delete means the chunk is already gone and counts as success.
fn bulk_item_report(body: &Value) -> BulkReport {
    let items = body
        .pointer("/items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut succeeded = 0usize;
    let mut failed_ids = Vec::new();
    let mut unidentified_failures = 0usize;
    for item in &items {
        let entry = item.pointer("/index").or_else(|| item.pointer("/delete"));
        let status_code = entry
            .and_then(|entry| entry.pointer("/status"))
            .and_then(Value::as_u64)
            .unwrap_or(500);
        if (200..300).contains(&status_code) || status_code == 404 {
            succeeded += 1;
        } else if let Some(id) = entry
            .and_then(|entry| entry.pointer("/_id"))
            .and_then(Value::as_str)
        {
            failed_ids.push(id.to_string());
        } else {
            unidentified_failures += 1;
        }
    }
    BulkReport {
        succeeded,
        failed_ids,
        unidentified_failures,
    }
}

fn retain_rejected(pending: &mut Vec<(String, String)>, failed_ids: Vec<String>) {
    let failed: HashSet<String> = failed_ids.into_iter().collect();
    pending.retain(|(id, _)| failed.contains(id));
}

fn chunk_id(document_id: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl RepositoryService for OpenSearchStore {
    fn backend_name(&self) -> &'static str {
        "opensearch"
    }

    fn supports_custom_collections(&self) -> bool {
        true
    }

    fn should_create_default_collection(&self) -> bool {
        true
    }

    fn normalize_score(&self, raw: f64) -> f64 {
        clamp_similarity(raw)
    }

    fn validate_document_source(&self, path: &str) -> Result<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(RagError::validation("source", "source path is empty"));
        }
        if trimmed.contains("..") {
            return Err(RagError::validation("source", "source path may not traverse"));
        }
        Ok(trimmed.to_string())
    }

    async fn ingest_document(
        &self,
        job: &IngestionJob,
        texts: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[Value],
    ) -> Result<RagDocument> {
        if texts.len() != embeddings.len() || texts.len() != metadatas.len() {
            return Err(RagError::Integrity(format!(
                "texts/embeddings/metadatas misaligned: {}/{}/{}",
                texts.len(),
                embeddings.len(),
                metadatas.len()
            )));
        }

        self.ensure_index(&job.collection_id).await?;

        let source = job
            .source_paths
            .first()
            .ok_or_else(|| RagError::validation("source_paths", "job has no source"))?;
        let document_id = derive_document_id(&job.repository_id, &job.collection_id, source);
        let index = self.index_name(&job.collection_id);

        let mut pending = Vec::with_capacity(texts.len());
        let mut subdocs = Vec::with_capacity(texts.len());
        for (position, ((text, embedding), metadata)) in
            texts.iter().zip(embeddings).zip(metadatas).enumerate()
        {
            let id = chunk_id(&document_id, position);
            let action = serde_json::to_string(&json!({
                "index": { "_index": &index, "_id": &id }
            }))?;
            let body = serde_json::to_string(&json!({
                "document_id": &document_id,
                "source": source,
                "text": text,
                "metadata": metadata,
                "vector": embedding,
            }))?;
            pending.push((id.clone(), format!("{action}\n{body}\n")));
            subdocs.push(id);
        }

        if !pending.is_empty() {
            self.bulk_until_acknowledged(pending, "upsert").await?;
        }

        Ok(RagDocument {
            document_id,
            repository_id: job.repository_id.clone(),
            collection_id: job.collection_id.clone(),
            document_name: source.rsplit('/').next().unwrap_or(source).to_string(),
            source: source.clone(),
            subdocs,
            chunk_strategy: job.chunk_strategy,
            username: job.username.clone(),
            ingestion_type: job.ingestion_type,
            ingested_at: Utc::now(),
        })
    }

    async fn delete_document(&self, document: &RagDocument) -> Result<()> {
        if document.subdocs.is_empty() {
            return Ok(());
        }

        let index = self.index_name(&document.collection_id);
        let mut pending = Vec::with_capacity(document.subdocs.len());
        for id in &document.subdocs {
            let action =
                serde_json::to_string(&json!({"delete": {"_index": &index, "_id": id}}))?;
            pending.push((id.clone(), format!("{action}\n")));
        }
        self.bulk_until_acknowledged(pending, "delete").await
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<()> {
        let index = self.index_name(collection_id);
        let response = self
            .client
            .delete(format!("{}/{}", self.endpoint, index))
            .send()
            .await?;
        let status = response.status();

        // Absent index means a previous drop already finished.
        if status == StatusCode::NOT_FOUND {
            info!(%index, "index already absent, treating drop as done");
            return Ok(());
        }
        if !status.is_success() {
            warn!(%index, %status, "index drop failed");
            return Err(RagError::BackendResponse {
                backend: "opensearch".to_string(),
                details: status.to_string(),
            });
        }
        Ok(())
    }

    async fn retrieve_documents(
        &self,
        query_vector: &[f32],
        _query_text: &str,
        collection_id: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let index = self.index_name(collection_id);
        let response = self
            .client
            .post(format!("{}/{}/_search", self.endpoint, index))
            .json(&json!({
                "size": top_k,
                "query": {
                    "knn": {
                        "vector": {
                            "vector": query_vector,
                            "k": top_k
                        }
                    }
                }
            }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RagError::NotFound(format!("collection {collection_id}")));
        }
        if !response.status().is_success() {
            return Err(RagError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        let body: Value = response.json().await?;
        let hits = body
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::new();
        for hit in hits {
            let raw_score = hit.pointer("/_score").and_then(Value::as_f64).unwrap_or(0.0);
            let metadata = hit
                .pointer("/_source/metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            results.push(RetrievedChunk {
                chunk_id: hit
                    .pointer("/_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                document_id: hit
                    .pointer("/_source/document_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                text: hit
                    .pointer("/_source/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score: self.normalize_score(raw_score),
                metadata,
            });
        }
        Ok(results)
    }

    async fn create_default_collection(&self) -> Result<()> {
        self.ensure_index(DEFAULT_COLLECTION_ID).await
    }
}
