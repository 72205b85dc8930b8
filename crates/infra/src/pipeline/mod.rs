//! The generation pipeline: producer, worker pool and status lookups, wired
//! over one job store, one queue, one marketplace and one inference client.
//!
//! Components are built once at process start and passed around as `Arc`s.
//! There is no global connection state.

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use atelier_generation::{GenerationClient, HttpGenerationClient};
use atelier_queue::{InMemoryTaskQueue, TaskQueue};

use crate::config::{PipelineConfig, StorageConfig};
use crate::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use crate::marketplace::{InMemoryMarketplace, MarketplaceStore, PostgresMarketplace};
use crate::queue::RedisStreamsTaskQueue;

pub mod producer;
pub mod status;
pub mod worker;

pub use producer::{BackgroundParams, Producer, SubmitError, SubmittedJob};
pub use status::{BatchSummary, JobView, MAX_SUMMARY_IDS, StatusError, StatusService};
pub use worker::{
    Outcome, WorkerContext, WorkerError, WorkerPoolHandle, WorkerStats, handle_task, process_delivery,
    spawn_worker_pool,
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("database: {0}")]
    Database(String),
    #[error("job store: {0}")]
    Store(#[from] crate::jobs::JobStoreError),
    #[error("queue: {0}")]
    Queue(#[from] atelier_queue::QueueError),
    #[error("generation client: {0}")]
    Generation(#[from] atelier_generation::GenerationError),
}

/// Shared pipeline components.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub marketplace: Arc<dyn MarketplaceStore>,
    pub generation: Arc<dyn GenerationClient>,
    pool: Option<Arc<PgPool>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("persistent", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        marketplace: Arc<dyn MarketplaceStore>,
        generation: Arc<dyn GenerationClient>,
    ) -> Self {
        Self {
            store,
            queue,
            marketplace,
            generation,
            pool: None,
        }
    }

    /// In-memory store, queue and marketplace around the given client.
    pub fn in_memory(marketplace: Arc<InMemoryMarketplace>, generation: Arc<dyn GenerationClient>) -> Self {
        Self::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryTaskQueue::new()),
            marketplace,
            generation,
        )
    }

    /// Build every component the configuration asks for.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let generation: Arc<dyn GenerationClient> = Arc::new(HttpGenerationClient::new(
            config.generation_url.clone(),
            config.generation_timeout,
        )?);

        match &config.storage {
            StorageConfig::InMemory => {
                info!("using in-memory job store, queue and marketplace");
                Ok(Self::new(
                    Arc::new(InMemoryJobStore::new()),
                    Arc::new(InMemoryTaskQueue::with_visibility_timeout(
                        config.queue_visibility_timeout,
                    )),
                    Arc::new(InMemoryMarketplace::new()),
                    generation,
                ))
            }
            StorageConfig::Persistent { database_url, queue } => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(database_url)
                    .await
                    .map_err(|e| PipelineError::Database(e.to_string()))?;
                let pool = Arc::new(pool);

                let store = PostgresJobStore::from_arc(pool.clone());
                store.ensure_schema().await?;

                let task_queue = RedisStreamsTaskQueue::connect(queue.clone()).await?;
                info!(
                    stream_key = %queue.stream_key,
                    group = %queue.group,
                    "using postgres job store and redis streams queue"
                );

                Ok(Self {
                    store: Arc::new(store),
                    queue: Arc::new(task_queue),
                    marketplace: Arc::new(PostgresMarketplace::new(pool.clone())),
                    generation,
                    pool: Some(pool),
                })
            }
        }
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.store.clone(), self.queue.clone(), self.marketplace.clone())
    }

    pub fn status(&self) -> StatusService {
        StatusService::new(self.store.clone())
    }

    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            marketplace: self.marketplace.clone(),
            generation: self.generation.clone(),
        }
    }

    /// Release database connections. Call after the worker pool has stopped.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
            info!("database pool closed");
        }
    }
}
