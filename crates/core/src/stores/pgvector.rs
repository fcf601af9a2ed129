use crate::error::{RagError, Result};
use crate::models::{derive_document_id, IngestionJob, RagDocument, RetrievedChunk};
use crate::traits::{normalize_cosine_distance, RepositoryService};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tracing::info;

pub const DEFAULT_COLLECTION_ID: &str = "default";

/// Managed-Postgres backend using the `vector` extension. One table per
/// collection; `<=>` cosine distance normalized onto [0, 1].
pub struct PgVectorStore {
    pool: PgPool,
    repository_id: String,
    dimensions: usize,
}

impl PgVectorStore {
    pub fn new(pool: PgPool, repository_id: impl Into<String>, dimensions: usize) -> Self {
        Self {
            pool,
            repository_id: repository_id.into(),
            dimensions,
        }
    }

    fn table_name(&self, collection_id: &str) -> String {
        collection_table_name(&self.repository_id, collection_id)
    }

    async fn ensure_table(&self, collection_id: &str) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;
        let table = self.table_name(collection_id);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                source TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}',
                embedding vector({dims}) NOT NULL
            )",
            dims = self.dimensions
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Identifiers cannot be bound as parameters; restrict them to a safe
/// alphabet instead.
fn collection_table_name(repository_id: &str, collection_id: &str) -> String {
    let sanitize = |value: &str| -> String {
        value
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    };
    format!(
        "rag_{}_{}",
        sanitize(repository_id),
        sanitize(collection_id)
    )
}

fn vector_literal(embedding: &[f32]) -> String {
    let body = embedding
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{body}]")
}

fn chunk_id(document_id: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl RepositoryService for PgVectorStore {
    fn backend_name(&self) -> &'static str {
        "pgvector"
    }

    fn supports_custom_collections(&self) -> bool {
        true
    }

    fn should_create_default_collection(&self) -> bool {
        true
    }

    fn normalize_score(&self, raw: f64) -> f64 {
        normalize_cosine_distance(raw)
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

        self.ensure_table(&job.collection_id).await?;

        let source = job
            .source_paths
            .first()
            .ok_or_else(|| RagError::validation("source_paths", "job has no source"))?;
        let document_id = derive_document_id(&job.repository_id, &job.collection_id, source);
        let table = self.table_name(&job.collection_id);

        let mut subdocs = Vec::with_capacity(texts.len());
        for (position, ((text, embedding), metadata)) in
            texts.iter().zip(embeddings).zip(metadatas).enumerate()
        {
            let id = chunk_id(&document_id, position);
            sqlx::query(&format!(
                "INSERT INTO {table} (chunk_id, document_id, source, content, metadata, embedding)
                 VALUES ($1, $2, $3, $4, $5::jsonb, $6::vector)
                 ON CONFLICT (chunk_id) DO UPDATE
                 SET content = EXCLUDED.content,
                     metadata = EXCLUDED.metadata,
                     embedding = EXCLUDED.embedding"
            ))
            .bind(&id)
            .bind(&document_id)
            .bind(source)
            .bind(text)
            .bind(serde_json::to_string(metadata)?)
            .bind(vector_literal(embedding))
            .execute(&self.pool)
            .await?;
            subdocs.push(id);
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
        let table = self.table_name(&document.collection_id);
        sqlx::query(&format!("DELETE FROM {table} WHERE chunk_id = ANY($1)"))
            .bind(&document.subdocs)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<()> {
        // DROP IF EXISTS makes re-invocation a no-op.
        let table = self.table_name(collection_id);
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await?;
        info!(%table, "collection table dropped");
        Ok(())
    }

    async fn retrieve_documents(
        &self,
        query_vector: &[f32],
        _query_text: &str,
        collection_id: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let table = self.table_name(collection_id);
        let rows = sqlx::query(&format!(
            "SELECT chunk_id, document_id, content, metadata::text AS metadata,
                    embedding <=> $1::vector AS distance
             FROM {table}
             ORDER BY distance
             LIMIT $2"
        ))
        .bind(vector_literal(query_vector))
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let distance: f64 = row.try_get("distance")?;
            let metadata_text: String = row.try_get("metadata")?;
            let metadata = serde_json::from_str::<Value>(&metadata_text)
                .ok()
                .and_then(|value| value.as_object().cloned())
                .unwrap_or_default();
            results.push(RetrievedChunk {
                chunk_id: row.try_get("chunk_id")?,
                document_id: row.try_get("document_id")?,
                text: row.try_get("content")?,
                score: self.normalize_score(distance),
                metadata,
            });
        }
        Ok(results)
    }

    async fn create_default_collection(&self) -> Result<()> {
        self.ensure_table(DEFAULT_COLLECTION_ID).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_sanitized_identifiers() {
        assert_eq!(
            collection_table_name("Repo-1", "My Coll!"),
            "rag_repo_1_my_coll_"
        );
    }

    #[test]
    fn vector_literal_matches_the_extension_syntax() {
        assert_eq!(vector_literal(&[0.5, -1.0, 2.0]), "[0.5,-1,2]");
    }

    #[test]
    fn distance_normalization_inverts_and_clamps() {
        assert_eq!(normalize_cosine_distance(0.0), 1.0);
        assert_eq!(normalize_cosine_distance(1.0), 0.5);
        assert_eq!(normalize_cosine_distance(2.0), 0.0);
        assert_eq!(normalize_cosine_distance(-0.5), 1.0);
    }
}
