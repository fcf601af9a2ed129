pub mod managed_kb;
pub mod opensearch;
pub mod pgvector;

pub use managed_kb::ManagedKbStore;
pub use opensearch::OpenSearchStore;
pub use pgvector::PgVectorStore;

use crate::error::{RagError, Result};
use crate::models::RepositoryConfig;
use crate::objects::ObjectStoreClient;
use crate::retry::RetryPolicy;
use crate::traits::RepositoryService;
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;

/// Closed set of backend families a repository can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryBackend {
    OpenSearch,
    PgVector,
    ManagedKb,
}

impl FromStr for RepositoryBackend {
    type Err = RagError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "opensearch" => Ok(Self::OpenSearch),
            "pgvector" => Ok(Self::PgVector),
            "managed-kb" | "managed_kb" => Ok(Self::ManagedKb),
            other => Err(RagError::Configuration(format!(
                "unsupported repository backend type: {other}"
            ))),
        }
    }
}

/// Connection material the factory draws from. Only the connections for
/// backends actually in use need to be present.
#[derive(Default, Clone)]
pub struct BackendConnections {
    pub opensearch_endpoint: Option<String>,
    pub pg_pool: Option<PgPool>,
    pub kb_endpoint: Option<String>,
    pub kb_id: Option<String>,
    pub object_store_endpoint: Option<String>,
    pub object_store_bucket: Option<String>,
}

/// Lazy Postgres pool for the pgvector backend; no connection is made until
/// first use.
pub fn connect_postgres_lazy(url: &str) -> Result<PgPool> {
    Ok(PgPool::connect_lazy(url)?)
}

/// Resolve a repository's declared backend tag to an adapter. Called at
/// repository-creation time so a misconfiguration fails then, not on first
/// ingest.
pub fn build_repository_service(
    config: &RepositoryConfig,
    connections: &BackendConnections,
    dimensions: usize,
) -> Result<Arc<dyn RepositoryService>> {
    let backend = RepositoryBackend::from_str(&config.backend)?;
    match backend {
        RepositoryBackend::OpenSearch => {
            let endpoint = connections.opensearch_endpoint.clone().ok_or_else(|| {
                RagError::Configuration("opensearch backend declared but no endpoint given".into())
            })?;
            Ok(Arc::new(OpenSearchStore::new(
                endpoint,
                config.repository_id.clone(),
                dimensions,
            )))
        }
        RepositoryBackend::PgVector => {
            let pool = connections.pg_pool.clone().ok_or_else(|| {
                RagError::Configuration("pgvector backend declared but no pool given".into())
            })?;
            Ok(Arc::new(PgVectorStore::new(
                pool,
                config.repository_id.clone(),
                dimensions,
            )))
        }
        RepositoryBackend::ManagedKb => {
            let endpoint = connections.kb_endpoint.clone().ok_or_else(|| {
                RagError::Configuration("managed-kb backend declared but no endpoint given".into())
            })?;
            let kb_id = connections.kb_id.clone().ok_or_else(|| {
                RagError::Configuration("managed-kb backend declared but no kb id given".into())
            })?;
            let objects = ObjectStoreClient::new(
                connections.object_store_endpoint.clone().ok_or_else(|| {
                    RagError::Configuration(
                        "managed-kb backend declared but no object-store endpoint given".into(),
                    )
                })?,
                connections
                    .object_store_bucket
                    .clone()
                    .unwrap_or_else(|| "rag-content".to_string()),
                RetryPolicy::default(),
            );
            Ok(Arc::new(ManagedKbStore::new(
                endpoint,
                kb_id,
                config.repository_id.clone(),
                objects,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository(backend: &str) -> RepositoryConfig {
        RepositoryConfig {
            repository_id: "repo".to_string(),
            backend: backend.to_string(),
            embedding_model: "e5-large".to_string(),
            allow_user_collections: true,
        }
    }

    #[test]
    fn unknown_backend_tag_is_a_configuration_error() {
        let error =
            build_repository_service(&repository("faiss"), &BackendConnections::default(), 384)
                .err()
                .unwrap();
        assert!(matches!(error, RagError::Configuration(_)));
        assert!(error.to_string().contains("faiss"));
    }

    #[test]
    fn declared_backend_without_connection_fails_at_creation() {
        let error = build_repository_service(
            &repository("opensearch"),
            &BackendConnections::default(),
            384,
        )
        .err()
        .unwrap();
        assert!(matches!(error, RagError::Configuration(_)));
    }

    #[test]
    fn opensearch_resolves_when_connected() {
        let connections = BackendConnections {
            opensearch_endpoint: Some("http://localhost:9200".to_string()),
            ..Default::default()
        };
        let service =
            build_repository_service(&repository("OpenSearch"), &connections, 384).unwrap();
        assert_eq!(service.backend_name(), "opensearch");
        assert!(service.supports_custom_collections());
    }
}
