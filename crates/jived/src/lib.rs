//! jived - the work-management engine daemon.
//!
//! Wires the three process-wide singletons (storage handle, embedding
//! service, execution registry) together with the hierarchy, sync, and
//! search engines, and exposes everything through the JSON tool surface.

pub mod embedding;
pub mod executor;
pub mod hierarchy;
pub mod resolver;
pub mod search;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use embedding::{Embedder, EmbeddingService, FeatureHashEmbedder};
use executor::{AcknowledgingRunner, AgentRunner, Executor, ExecutorConfig};
use hierarchy::HierarchyEngine;
use jive_core::Config;
use search::SearchEngine;
use server::AppState;
use storage::Storage;
use store::WorkItemStore;
use sync::SyncEngine;
use tools::{ToolDispatcher, TruncationPolicy};

/// The assembled engine process.
pub struct Daemon {
    config: Config,
    storage: Arc<Storage>,
    store: Arc<WorkItemStore>,
    executor: Arc<Executor>,
    tools: Arc<ToolDispatcher>,
}

impl Daemon {
    /// Initialize with the built-in embedding provider and agent runner.
    pub async fn new(config: Config) -> eyre::Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::new(FeatureHashEmbedder::new(config.vector_dim));
        if config.embedding_model != "feature-hash" {
            tracing::warn!(
                model = %config.embedding_model,
                "no provider registered for this embedding model, using feature-hash"
            );
        }
        Self::with_providers(config, embedder, Arc::new(AcknowledgingRunner)).await
    }

    /// Initialize with explicit embedding and agent providers. Opens the
    /// storage handle, runs migrations, and builds the FTS index.
    pub async fn with_providers(
        config: Config,
        embedder: Arc<dyn Embedder>,
        runner: Arc<dyn AgentRunner>,
    ) -> eyre::Result<Self> {
        let db_path = config.data_path.join("jive.db");
        let storage = Arc::new(Storage::new(&db_path).await?);
        storage.migrate_embedded().await?;

        let embedding = Arc::new(EmbeddingService::new(
            embedder,
            config.embedding_concurrency,
            config.embedding_timeout_sec,
        ));
        let search = Arc::new(SearchEngine::new(
            config.vector_metric,
            config.hybrid_alpha,
            config.enable_fts,
        ));
        search.init_fts(&storage).await?;

        let store = Arc::new(WorkItemStore::new(
            Arc::clone(&storage),
            embedding,
            search,
            config.search_timeout_sec,
        ));
        let hierarchy = Arc::new(HierarchyEngine::new(Arc::clone(&storage)));
        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&storage),
            config.tasks_dir.clone(),
            config.sync_state_dir.clone(),
        ));
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&storage),
            runner,
            ExecutorConfig {
                max_parallel: config.max_parallel_executions,
                item_timeout: Duration::from_secs(config.execution_timeout_minutes * 60),
            },
        ));
        let tools = Arc::new(ToolDispatcher::new(
            Arc::clone(&store),
            hierarchy,
            sync,
            Arc::clone(&executor),
            TruncationPolicy {
                enabled: config.enable_auto_truncation,
                max_response_size: config.max_response_size,
                threshold: config.truncation_threshold,
            },
        ));

        tracing::info!(
            db = %db_path.display(),
            vector_dim = config.vector_dim,
            fts = config.enable_fts,
            "engine initialized"
        );

        Ok(Self {
            config,
            storage,
            store,
            executor,
            tools,
        })
    }

    pub fn tools(&self) -> Arc<ToolDispatcher> {
        Arc::clone(&self.tools)
    }

    pub fn store(&self) -> Arc<WorkItemStore> {
        Arc::clone(&self.store)
    }

    /// Serve the tool surface until the process is interrupted.
    pub async fn run(&self) -> eyre::Result<()> {
        let state = Arc::new(AppState {
            tools: Arc::clone(&self.tools),
            store: Arc::clone(&self.store),
        });
        server::start_server(state, self.config.listen_port)
            .await
            .map_err(|e| eyre::eyre!("server error: {e}"))
    }

    /// Shutdown: cancel live executions, then flush and close storage.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        self.executor.shutdown().await;
        self.storage.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn daemon_initializes_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.resolve_paths(dir.path());

        let daemon = Daemon::new(config).await.unwrap();

        // The tool surface is live immediately after initialize.
        let response = daemon
            .tools()
            .dispatch(
                "jive_create_work_item",
                serde_json::json!({
                    "item_type": "initiative",
                    "title": "Q3 platform work",
                    "description": "top level initiative",
                }),
            )
            .await;
        assert_eq!(response["success"], serde_json::json!(true));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn daemon_survives_reopen_of_existing_data() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.resolve_paths(dir.path());

        let daemon = Daemon::new(config.clone()).await.unwrap();
        let response = daemon
            .tools()
            .dispatch(
                "jive_create_work_item",
                serde_json::json!({
                    "item_type": "task",
                    "title": "persisted",
                    "description": "outlives the first daemon",
                }),
            )
            .await;
        let id = response["work_item_id"].as_str().unwrap().to_string();
        daemon.shutdown().await;

        let daemon = Daemon::new(config).await.unwrap();
        let response = daemon
            .tools()
            .dispatch(
                "jive_get_work_item",
                serde_json::json!({"work_item_id": id}),
            )
            .await;
        assert_eq!(response["success"], serde_json::json!(true));
        assert_eq!(response["work_item"]["title"], serde_json::json!("persisted"));
        daemon.shutdown().await;
    }
}
