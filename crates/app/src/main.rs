use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use rag_gateway_core::{
    connect_postgres_lazy, AccessCacheConfig, BackendConnections, ChunkStrategy,
    DirectorySnapshot, Embedder, EmbeddingPrefixConfig, HashEmbedder, HttpEmbedder,
    IngestionEngine, IngestionRequest, IngestionType, MemoryDirectory, MemoryDocumentStore,
    Permission, RagCollectionConfig, RepositoryConfig, SourceDocument, StoreSnapshot, UserContext,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rag-gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Tracking-state file for jobs, documents, and the collection registry.
    #[arg(long, default_value = ".rag-gateway-state.json")]
    state_file: PathBuf,

    /// Repository to operate on.
    #[arg(long, default_value = "default")]
    repository: String,

    /// Backend family for the repository: opensearch, pgvector, or managed-kb.
    #[arg(long, default_value = "opensearch")]
    backend: String,

    /// Default embedding model for the repository.
    #[arg(long, default_value = "intfloat/e5-large-v2")]
    embedding_model: String,

    /// Embedding vector width.
    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// OpenAI-style embeddings endpoint. Without it a deterministic local
    /// embedder is used, suitable only for smoke tests.
    #[arg(long, env = "EMBEDDINGS_URL")]
    embeddings_url: Option<String>,

    #[arg(long, env = "EMBEDDINGS_API_KEY", hide_env_values = true)]
    embeddings_api_key: Option<String>,

    /// OpenSearch base URL
    #[arg(long, default_value = "http://localhost:9200")]
    opensearch_url: String,

    /// Postgres connection string for the pgvector backend.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Managed knowledge-base API base URL.
    #[arg(long)]
    kb_url: Option<String>,

    /// Managed knowledge-base id.
    #[arg(long)]
    kb_id: Option<String>,

    /// Object-store base URL for staged managed-kb content.
    #[arg(long)]
    object_store_url: Option<String>,

    /// Object-store bucket for staged managed-kb content.
    #[arg(long, default_value = "rag-content")]
    object_store_bucket: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum PermissionArg {
    Read,
    Write,
    Delete,
}

impl From<PermissionArg> for Permission {
    fn from(value: PermissionArg) -> Self {
        match value {
            PermissionArg::Read => Permission::Read,
            PermissionArg::Write => Permission::Write,
            PermissionArg::Delete => Permission::Delete,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a collection in the repository.
    CreateCollection {
        #[arg(long)]
        collection: String,
        /// Display name; defaults to the collection id.
        #[arg(long)]
        name: Option<String>,
        /// Groups allowed to read the collection. Empty means public.
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
        #[arg(long, default_value_t = false)]
        private: bool,
        #[arg(long, default_value = "admin")]
        user: String,
        #[arg(long, default_value_t = false)]
        admin: bool,
    },
    /// Ingest one text file into a collection.
    Ingest {
        #[arg(long)]
        collection: String,
        /// Path of the text file to ingest.
        #[arg(long)]
        file: PathBuf,
        /// Source identifier recorded for the document; defaults to the file path.
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Retrieve the top matching chunks for a query.
    Retrieve {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "10")]
        top_k: usize,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
        #[arg(long, default_value_t = false)]
        admin: bool,
    },
    /// Delete one ingested document and its indexed chunks.
    Delete {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        document_id: String,
    },
    /// Delete every document in a collection and the collection itself.
    Teardown {
        #[arg(long)]
        collection: String,
    },
    /// Evaluate the access rules for a user against a collection.
    CheckAccess {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        user: String,
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
        #[arg(long, default_value_t = false)]
        admin: bool,
        #[arg(long, value_enum, default_value_t = PermissionArg::Read)]
        permission: PermissionArg,
    },
}

/// Tracking state persisted between invocations. Vectors live in the backend;
/// this file only carries provenance and the registry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct GatewayState {
    store: StoreSnapshot,
    directory: DirectorySnapshot,
}

fn load_state(path: &Path) -> anyhow::Result<GatewayState> {
    if !path.exists() {
        return Ok(GatewayState::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn save_state(path: &Path, state: &GatewayState) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}

fn user_context(user: String, groups: Vec<String>, admin: bool) -> UserContext {
    UserContext {
        user_id: user,
        groups,
        is_admin: admin,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let embedder: Arc<dyn Embedder> = match &cli.embeddings_url {
        Some(url) => Arc::new(HttpEmbedder::new(
            url.as_str(),
            cli.embedding_model.as_str(),
            cli.embedding_dimensions,
            EmbeddingPrefixConfig::for_model(&cli.embedding_model),
            cli.embeddings_api_key.clone(),
        )),
        None => Arc::new(HashEmbedder {
            dimensions: cli.embedding_dimensions,
        }),
    };

    let connections = BackendConnections {
        opensearch_endpoint: Some(cli.opensearch_url.clone()),
        pg_pool: match &cli.database_url {
            Some(url) => Some(connect_postgres_lazy(url)?),
            None => None,
        },
        kb_endpoint: cli.kb_url.clone(),
        kb_id: cli.kb_id.clone(),
        object_store_endpoint: cli.object_store_url.clone(),
        object_store_bucket: Some(cli.object_store_bucket.clone()),
    };

    let state = load_state(&cli.state_file)?;
    let store = Arc::new(MemoryDocumentStore::new());
    store.restore(state.store).await;
    let directory = MemoryDirectory::new();
    directory.restore(state.directory).await;

    let engine = IngestionEngine::new(
        store.clone(),
        directory.clone(),
        embedder,
        AccessCacheConfig::default(),
    );
    engine
        .register_repository(
            RepositoryConfig {
                repository_id: cli.repository.clone(),
                backend: cli.backend.clone(),
                embedding_model: cli.embedding_model.clone(),
                allow_user_collections: true,
            },
            &connections,
        )
        .await?;

    info!(
        version = app_version,
        repository = %cli.repository,
        backend = %cli.backend,
        started_at = %Utc::now().to_rfc3339(),
        "rag-gateway boot"
    );

    match cli.command {
        Command::CreateCollection {
            collection,
            name,
            groups,
            private,
            user,
            admin,
        } => {
            let caller = user_context(user.clone(), Vec::new(), admin);
            engine
                .create_collection(
                    &caller,
                    RagCollectionConfig {
                        collection_id: collection.clone(),
                        repository_id: cli.repository.clone(),
                        name: name.unwrap_or_else(|| collection.clone()),
                        allowed_groups: groups,
                        created_by: Some(user),
                        private,
                        status: rag_gateway_core::CollectionStatus::Active,
                        chunk_strategy: None,
                    },
                )
                .await?;
            println!("collection {collection} created");
        }
        Command::Ingest {
            collection,
            file,
            source,
            chunk_size,
            chunk_overlap,
            user,
        } => {
            let text = std::fs::read_to_string(&file)?;
            let source = source.unwrap_or_else(|| file.display().to_string());
            let chunk_strategy = if chunk_size.is_some() || chunk_overlap.is_some() {
                Some(ChunkStrategy::Fixed {
                    size: chunk_size,
                    overlap: chunk_overlap,
                })
            } else {
                None
            };

            let job = engine
                .create_job(IngestionRequest {
                    repository_id: cli.repository.clone(),
                    collection_id: collection,
                    embedding_model: None,
                    source_paths: vec![source.clone()],
                    chunk_strategy,
                    ingestion_type: IngestionType::Manual,
                    username: user,
                })
                .await?;

            let document = engine
                .run_ingestion(
                    &job.job_id,
                    vec![SourceDocument {
                        source,
                        text,
                        metadata: serde_json::Map::new(),
                    }],
                )
                .await?;

            println!(
                "document {} ingested: {} chunks, job {}",
                document.document_id,
                document.subdocs.len(),
                job.job_id
            );
        }
        Command::Retrieve {
            collection,
            query,
            top_k,
            user,
            groups,
            admin,
        } => {
            let caller = user_context(user, groups, admin);
            let hits = engine.retrieve(&caller, &collection, &query, top_k).await?;
            println!("query: {query}");
            for hit in hits {
                println!(
                    "score={:.4} chunk={} document_id={}",
                    hit.score, hit.chunk_id, hit.document_id
                );
                println!("  text:\n{}", hit.text);
            }
        }
        Command::Delete {
            collection,
            document_id,
        } => {
            engine
                .run_deletion(&cli.repository, &collection, &document_id)
                .await?;
            println!("document {document_id} deleted");
        }
        Command::Teardown { collection } => {
            let outcome = engine.teardown_collection(&cli.repository, &collection).await?;
            println!(
                "teardown of {collection}: {} deleted, {} failed",
                outcome.succeeded, outcome.failed
            );
            for error in outcome.errors {
                println!("  failed: {error}");
            }
        }
        Command::CheckAccess {
            collection,
            user,
            groups,
            admin,
            permission,
        } => {
            let caller = user_context(user, groups, admin);
            let decision = engine
                .access_policy()
                .check_collection_permission(&caller, &collection, permission.into())
                .await;
            println!(
                "{}: {} ({})",
                collection,
                if decision.allowed { "allowed" } else { "denied" },
                decision.reason
            );
            if !decision.granting_groups.is_empty() {
                println!("  granting groups: {}", decision.granting_groups.join(", "));
            }
        }
    }

    let state = GatewayState {
        store: store.snapshot().await,
        directory: directory.snapshot().await,
    };
    save_state(&cli.state_file, &state)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rag_gateway_core::{ChunkStrategy, IngestionJob, IngestionType};

    #[test]
    fn state_file_round_trips_jobs_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = GatewayState::default();
        state.store.jobs.push(IngestionJob::new(
            "repo",
            "coll",
            "e5-large",
            vec!["docs/a.txt".to_string()],
            ChunkStrategy::None,
            IngestionType::Manual,
            "alice",
        ));
        state.directory.repositories.push(RepositoryConfig {
            repository_id: "repo".to_string(),
            backend: "opensearch".to_string(),
            embedding_model: "e5-large".to_string(),
            allow_user_collections: true,
        });

        save_state(&path, &state).unwrap();
        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.store.jobs.len(), 1);
        assert_eq!(loaded.store.jobs[0].repository_id, "repo");
        assert_eq!(loaded.directory.repositories[0].backend, "opensearch");
    }

    #[test]
    fn missing_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = load_state(&dir.path().join("absent.json")).unwrap();
        assert!(state.store.jobs.is_empty());
        assert!(state.directory.collections.is_empty());
    }
}
