//! Worker pool: drains the task queue and drives each job to a terminal state.
//!
//! Per task, strictly in order:
//!
//! 1. load the job; unknown or already terminal → discard (duplicate delivery)
//! 2. call the inference service
//! 3. re-check the job, so a run whose lease was reclaimed does not write
//! 4. write the result onto the owning record
//! 5. mark the job COMPLETED (or FAILED if 2 or 4 failed)
//! 6. ack the delivery, only once the job store write went through
//!
//! A task that cannot reach the job store is left unacked and comes back after
//! the queue's visibility timeout. That timeout must outlast one generation
//! call; `PipelineConfig` refuses settings where it does not.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use atelier_core::{JobId, OwnerRef};
use atelier_generation::GenerationClient;
use atelier_queue::{Delivery, QueueError, Task, TaskQueue};

use crate::config::WorkerConfig;
use crate::jobs::{JobStore, JobStoreError};
use crate::marketplace::{MarketplaceError, MarketplaceStore};

/// Failure reason recorded when a task handler panics.
pub const PANIC_REASON: &str = "worker panicked";

/// Everything a worker needs, shared by all consumers of one pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub marketplace: Arc<dyn MarketplaceStore>,
    pub generation: Arc<dyn GenerationClient>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext").finish_non_exhaustive()
    }
}

/// What happened to one delivered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { result_url: String },
    Failed { reason: String },
    /// Nothing to do: duplicate delivery, or the job is unknown.
    Discarded(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("job store unavailable: {0}")]
    Store(#[from] JobStoreError),
    #[error("ack failed: {0}")]
    Ack(#[from] QueueError),
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    /// Deliveries left unacked because of an infrastructure error.
    pub errors: u64,
    pub in_flight: usize,
}

/// Run one task to its outcome. Does not ack.
#[instrument(
    skip(ctx, task),
    fields(job_id = %task.job_id, owner = %task.owner)
)]
pub async fn handle_task(ctx: &WorkerContext, task: &Task) -> Result<Outcome, WorkerError> {
    let Some(job) = ctx.store.get(task.job_id).await? else {
        warn!("task references unknown job, discarding");
        return Ok(Outcome::Discarded("unknown job".to_string()));
    };

    if job.is_terminal() {
        debug!(status = %job.status, "job already terminal, discarding duplicate delivery");
        return Ok(Outcome::Discarded(format!("job already {}", job.status)));
    }

    if job.owner != task.owner || task.payload.owner_kind() != job.owner_kind() {
        warn!(job_owner = %job.owner, "task does not match its job");
        return fail(ctx, job.id, "task does not match job owner").await;
    }

    let content = match ctx.generation.generate(&task.payload).await {
        Ok(content) => content,
        Err(e) => {
            warn!(error = %e, "generation failed");
            return fail(ctx, job.id, &e.reason()).await;
        }
    };

    match ctx.store.get(job.id).await? {
        Some(current) if !current.is_terminal() => {}
        Some(current) => {
            warn!(status = %current.status, "job finished by another delivery during generation, dropping result");
            return Ok(Outcome::Discarded(format!("job already {}", current.status)));
        }
        None => {
            warn!("job vanished during generation, dropping result");
            return Ok(Outcome::Discarded("unknown job".to_string()));
        }
    }

    if let Err(e) = apply_result(ctx.marketplace.as_ref(), job.owner, &content.url).await {
        warn!(error = %e, "owning record update failed");
        return fail(ctx, job.id, "owning record update failed").await;
    }

    match ctx.store.mark_completed(job.id, &content.url).await {
        Ok(_) => {
            info!(result_url = %content.url, "job completed");
            Ok(Outcome::Completed {
                result_url: content.url,
            })
        }
        Err(JobStoreError::AlreadyTerminal { status, .. }) => {
            warn!(status = %status, "job finished concurrently, keeping existing outcome");
            Ok(Outcome::Discarded(format!("job already {status}")))
        }
        Err(e) => Err(e.into()),
    }
}

/// Write the generated URL onto the record the job augments.
pub async fn apply_result(
    marketplace: &dyn MarketplaceStore,
    owner: OwnerRef,
    url: &str,
) -> Result<(), MarketplaceError> {
    match owner {
        OwnerRef::ProfileBackground { artist_id } => marketplace.set_background_poster(artist_id, url).await,
        OwnerRef::ProductImage { product_media_id } => marketplace.set_generated_image(product_media_id, url).await,
    }
}

async fn fail(ctx: &WorkerContext, id: JobId, reason: &str) -> Result<Outcome, WorkerError> {
    match ctx.store.mark_failed(id, reason).await {
        Ok(_) => Ok(Outcome::Failed {
            reason: reason.to_string(),
        }),
        Err(JobStoreError::AlreadyTerminal { status, .. }) => {
            warn!(job_id = %id, status = %status, "job finished concurrently, keeping existing outcome");
            Ok(Outcome::Discarded(format!("job already {status}")))
        }
        Err(e) => Err(e.into()),
    }
}

/// Handle one delivery inside its own failure boundary, then ack it.
///
/// The handler runs on its own tokio task so a panic is contained; the job is
/// then marked FAILED. The delivery is acked only if the job store accepted
/// the outcome.
pub async fn process_delivery(ctx: &WorkerContext, delivery: Delivery) -> Result<Outcome, WorkerError> {
    let job_id = delivery.task.job_id;
    let joined = {
        let ctx = ctx.clone();
        let task = delivery.task.clone();
        tokio::spawn(async move { handle_task(&ctx, &task).await }).await
    };

    let result = match joined {
        Ok(result) => result,
        Err(join_err) => {
            error!(job_id = %job_id, error = %join_err, "task handler panicked");
            fail(ctx, job_id, PANIC_REASON).await
        }
    };

    if result.is_ok() {
        ctx.queue.ack(&delivery).await?;
    }
    result
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    consumers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    /// Stop taking new tasks, let in-flight tasks finish, and wait for every consumer.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for consumer in self.consumers {
            if let Err(e) = consumer.await {
                error!(error = %e, "worker consumer ended abnormally");
            }
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Spawn `config.concurrency` consumers sharing one queue.
pub fn spawn_worker_pool(ctx: WorkerContext, config: &WorkerConfig) -> WorkerPoolHandle {
    let cancel = CancellationToken::new();
    let stats = Arc::new(Mutex::new(WorkerStats::default()));

    let consumers = (0..config.concurrency.max(1))
        .map(|index| {
            let consumer = format!("{}-{}", config.pool_name, index);
            tokio::spawn(run_consumer(
                ctx.clone(),
                consumer,
                config.clone(),
                cancel.clone(),
                stats.clone(),
            ))
        })
        .collect();

    info!(
        pool = %config.pool_name,
        concurrency = config.concurrency.max(1),
        "worker pool started"
    );

    WorkerPoolHandle {
        cancel,
        consumers,
        stats,
    }
}

async fn run_consumer(
    ctx: WorkerContext,
    consumer: String,
    config: WorkerConfig,
    cancel: CancellationToken,
    stats: Arc<Mutex<WorkerStats>>,
) {
    debug!(consumer = %consumer, "consumer started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = ctx.queue.dequeue(&consumer) => next,
        };

        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(consumer = %consumer, error = %e, "dequeue failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_backoff) => continue,
                }
            }
        };

        debug!(
            consumer = %consumer,
            job_id = %delivery.task.job_id,
            delivery_count = delivery.delivery_count,
            "task received"
        );
        stats.lock().unwrap().in_flight += 1;

        let result = process_delivery(&ctx, delivery).await;

        let mut s = stats.lock().unwrap();
        s.in_flight -= 1;
        s.processed += 1;
        match &result {
            Ok(Outcome::Completed { .. }) => s.completed += 1,
            Ok(Outcome::Failed { .. }) => s.failed += 1,
            Ok(Outcome::Discarded(_)) => s.discarded += 1,
            Err(e) => {
                s.errors += 1;
                error!(consumer = %consumer, error = %e, "task left unacked for redelivery");
            }
        }
    }

    debug!(consumer = %consumer, "consumer stopped");
}
