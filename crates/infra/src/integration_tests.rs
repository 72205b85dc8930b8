//! End-to-end pipeline tests over the in-memory backends.
//!
//! Producer → queue → worker → job store + marketplace, with a scripted
//! inference client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use atelier_core::{ArtistId, GenerationRequest, Job, JobId, JobStatus, OwnerRef, ProductId, ProductMediaId};
use atelier_generation::{FakeGenerationClient, GeneratedContent, GenerationClient, GenerationError};
use atelier_queue::{Delivery, InMemoryTaskQueue, QueueError, Task, TaskHandle, TaskQueue};

use crate::config::WorkerConfig;
use crate::jobs::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
use crate::marketplace::{ArtistDescription, InMemoryMarketplace, ProductMedia, ProductShootContext, ProfileContext};
use crate::pipeline::worker::PANIC_REASON;
use crate::pipeline::{
    BackgroundParams, Outcome, Pipeline, StatusError, SubmitError, WorkerContext, WorkerError, process_delivery,
    spawn_worker_pool,
};

struct Harness {
    store: Arc<InMemoryJobStore>,
    queue: Arc<InMemoryTaskQueue>,
    market: Arc<InMemoryMarketplace>,
    generation: Arc<FakeGenerationClient>,
    pipeline: Pipeline,
}

fn harness() -> Harness {
    harness_with_queue(InMemoryTaskQueue::new())
}

fn harness_with_queue(queue: InMemoryTaskQueue) -> Harness {
    let store = Arc::new(InMemoryJobStore::new());
    let queue = Arc::new(queue);
    let market = Arc::new(InMemoryMarketplace::new());
    let generation = Arc::new(FakeGenerationClient::new());
    let pipeline = Pipeline::new(store.clone(), queue.clone(), market.clone(), generation.clone());

    market.add_profile(ProfileContext {
        artist_id: ArtistId::new(42),
        profession: "Glass Blower".into(),
        active_description: Some(ArtistDescription {
            text: "I shape molten glass.".into(),
            location: Some("Murano".into()),
            background_info: Some("Family studio since 1920".into()),
            experience: Some("15 years".into()),
        }),
    });
    market.add_product(ProductShootContext {
        product_id: ProductId::new(7),
        art_form: "Hand-blown glass".into(),
        product_description: Some("Blue vase".into()),
        media: (1..=3)
            .map(|i| ProductMedia {
                id: ProductMediaId::new(100 + i),
                image_url: format!("https://cdn.example/raw/{i}.jpg"),
            })
            .collect(),
    });

    Harness {
        store,
        queue,
        market,
        generation,
        pipeline,
    }
}

/// Dequeue and process everything currently on the queue.
async fn drain(h: &Harness) -> Vec<Outcome> {
    let ctx = h.pipeline.worker_context();
    let mut outcomes = Vec::new();
    while h.queue.pending_count() > 0 {
        let delivery = h.queue.dequeue("test-worker").await.unwrap();
        outcomes.push(process_delivery(&ctx, delivery).await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn background_submission_completes_and_sets_poster() {
    let h = harness();
    let submitted = h
        .pipeline
        .producer()
        .submit_background(ArtistId::new(42), BackgroundParams::default())
        .await
        .unwrap();

    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].status, JobStatus::Pending);
    assert_eq!(h.queue.pending_count(), 1);
    assert_eq!(h.market.background_poster(ArtistId::new(42)), None);

    let outcomes = drain(&h).await;
    let expected = "https://generated.example/background/glass-blower.png";
    assert_eq!(
        outcomes,
        vec![Outcome::Completed {
            result_url: expected.to_string()
        }]
    );

    let view = h.pipeline.status().get_status(submitted[0].job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.result_url.as_deref(), Some(expected));
    assert_eq!(h.market.background_poster(ArtistId::new(42)).as_deref(), Some(expected));
    assert_eq!(h.queue.in_flight_count(), 0);
}

#[tokio::test]
async fn background_prompt_prefers_request_overrides_over_active_description() {
    let h = harness();
    h.pipeline
        .producer()
        .submit_background(
            ArtistId::new(42),
            BackgroundParams {
                background_text: None,
                experience_text: Some("20 years".into()),
                custom_req_text: Some("sunset light".into()),
            },
        )
        .await
        .unwrap();
    drain(&h).await;

    let calls = h.generation.calls();
    let GenerationRequest::ProfileBackground(req) = &calls[0] else {
        panic!("expected a background request, got {calls:?}");
    };
    assert_eq!(req.profession, "Glass Blower");
    assert_eq!(req.location, "Murano");
    assert_eq!(req.background.as_deref(), Some("Family studio since 1920"));
    assert_eq!(req.experience.as_deref(), Some("20 years"));
    assert_eq!(req.description.as_deref(), Some("I shape molten glass."));
    assert_eq!(req.custom_request.as_deref(), Some("sunset light"));
}

#[tokio::test]
async fn each_media_item_gets_its_own_job_and_task() {
    let h = harness();
    let submitted = h
        .pipeline
        .producer()
        .submit_professional_shoot(ProductId::new(7))
        .await
        .unwrap();

    assert_eq!(submitted.len(), 3);
    assert_eq!(h.store.len(), 3);
    assert_eq!(h.queue.pending_count(), 3);
    let owners: Vec<OwnerRef> = submitted.iter().map(|s| s.owner).collect();
    assert_eq!(
        owners,
        (101..=103)
            .map(|id| OwnerRef::product_image(ProductMediaId::new(id)))
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn one_failed_shoot_leaves_siblings_completed() {
    let h = harness();
    h.generation.fail_image("https://cdn.example/raw/2.jpg");

    let submitted = h
        .pipeline
        .producer()
        .submit_professional_shoot(ProductId::new(7))
        .await
        .unwrap();
    drain(&h).await;

    let ids: Vec<_> = submitted.iter().map(|s| s.job_id).collect();
    let summary = h.pipeline.status().summarize(&ids).await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert!(summary.is_settled());
    assert!(!summary.all_completed());

    let failed = h.pipeline.status().get_status(ids[1]).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.result_url, None);
    assert_eq!(failed.failure.as_deref(), Some("inference service returned 500"));

    assert!(h.market.generated_image(ProductMediaId::new(101)).is_some());
    assert_eq!(h.market.generated_image(ProductMediaId::new(102)), None);
    assert!(h.market.generated_image(ProductMediaId::new(103)).is_some());
}

#[tokio::test]
async fn generation_failure_never_touches_the_owner() {
    let h = harness();
    h.generation.fail_everything(true);

    let submitted = h
        .pipeline
        .producer()
        .submit_background(ArtistId::new(42), BackgroundParams::default())
        .await
        .unwrap();
    let outcomes = drain(&h).await;

    assert!(matches!(outcomes[0], Outcome::Failed { .. }));
    let job = h.store.get(submitted[0].job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(h.market.background_poster(ArtistId::new(42)), None);
}

#[tokio::test]
async fn owner_write_failure_marks_job_failed() {
    let h = harness();
    h.market.fail_writes(true);

    let submitted = h
        .pipeline
        .producer()
        .submit_background(ArtistId::new(42), BackgroundParams::default())
        .await
        .unwrap();
    drain(&h).await;

    let job = h.store.get(submitted[0].job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_url, None);
    assert_eq!(job.failure.as_deref(), Some("owning record update failed"));
    assert_eq!(h.queue.in_flight_count(), 0);
}

#[tokio::test]
async fn duplicate_delivery_transitions_the_job_once() {
    let h = harness();
    let submitted = h
        .pipeline
        .producer()
        .submit_background(ArtistId::new(42), BackgroundParams::default())
        .await
        .unwrap();

    let ctx = h.pipeline.worker_context();
    let first = h.queue.dequeue("w1").await.unwrap();
    let duplicate = Delivery {
        delivery_count: first.delivery_count + 1,
        ..first.clone()
    };

    let outcome = process_delivery(&ctx, first).await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { .. }));
    let done = h.store.get(submitted[0].job_id).await.unwrap().unwrap();

    let again = process_delivery(&ctx, duplicate).await.unwrap();
    assert_eq!(again, Outcome::Discarded("job already COMPLETED".to_string()));

    let after = h.store.get(submitted[0].job_id).await.unwrap().unwrap();
    assert_eq!(after, done);
    assert_eq!(h.generation.calls().len(), 1);
}

#[tokio::test]
async fn task_for_unknown_job_is_discarded_and_acked() {
    let h = harness();
    let task = Task::new(
        atelier_core::JobId::new(),
        OwnerRef::profile_background(ArtistId::new(42)),
        GenerationRequest::ProfileBackground(Default::default()),
    );
    h.queue.enqueue(&task).await.unwrap();

    let outcomes = drain(&h).await;
    assert_eq!(outcomes, vec![Outcome::Discarded("unknown job".to_string())]);
    assert_eq!(h.queue.in_flight_count(), 0);
    assert!(h.generation.calls().is_empty());
}

/// Job store whose terminal transitions fail until `failures` runs out.
struct FlakyStore {
    inner: Arc<InMemoryJobStore>,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn storage_error(&self) -> Option<JobStoreError> {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| JobStoreError::Storage("connection reset by peer".into()))
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create(&self, owner: OwnerRef) -> Result<Job, JobStoreError> {
        self.inner.create(owner).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(id).await
    }

    async fn mark_completed(&self, id: JobId, result_url: &str) -> Result<Job, JobStoreError> {
        match self.storage_error() {
            Some(e) => Err(e),
            None => self.inner.mark_completed(id, result_url).await,
        }
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Job, JobStoreError> {
        match self.storage_error() {
            Some(e) => Err(e),
            None => self.inner.mark_failed(id, reason).await,
        }
    }

    async fn revoke(&self, id: JobId) -> Result<(), JobStoreError> {
        self.inner.revoke(id).await
    }

    async fn list_for_owner(&self, owner: OwnerRef, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list_for_owner(owner, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.inner.stats().await
    }
}

#[tokio::test(start_paused = true)]
async fn unpersisted_outcome_is_not_acked_and_is_redelivered() {
    let h = harness_with_queue(InMemoryTaskQueue::with_visibility_timeout(Duration::from_secs(30)));
    let flaky = Arc::new(FlakyStore {
        inner: h.store.clone(),
        failures: AtomicUsize::new(1),
    });
    let pipeline = Pipeline::new(flaky, h.queue.clone(), h.market.clone(), h.generation.clone());
    let submitted = pipeline
        .producer()
        .submit_background(ArtistId::new(42), BackgroundParams::default())
        .await
        .unwrap();
    let job_id = submitted[0].job_id;
    let ctx = pipeline.worker_context();

    let first = h.queue.dequeue("w1").await.unwrap();
    let err = process_delivery(&ctx, first).await.unwrap_err();
    assert!(matches!(err, WorkerError::Store(JobStoreError::Storage(_))), "{err:?}");
    assert_eq!(h.queue.in_flight_count(), 1);
    assert_eq!(h.store.get(job_id).await.unwrap().unwrap().status, JobStatus::Pending);

    let start = tokio::time::Instant::now();
    let redelivered = h.queue.dequeue("w2").await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert_eq!(redelivered.delivery_count, 2);
    assert_eq!(redelivered.task.job_id, job_id);

    let outcome = process_delivery(&ctx, redelivered.clone()).await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert_eq!(h.queue.in_flight_count(), 0);

    // a straggling copy of the same task changes nothing
    let done = h.store.get(job_id).await.unwrap().unwrap();
    let again = process_delivery(&ctx, redelivered).await.unwrap();
    assert_eq!(again, Outcome::Discarded("job already COMPLETED".to_string()));
    assert_eq!(h.store.get(job_id).await.unwrap().unwrap(), done);
    assert_eq!(h.store.stats().await.unwrap().completed, 1);
}

/// Succeeds slowly on the first call, fails fast on every later one.
struct SlowThenFailingClient {
    calls: AtomicUsize,
}

#[async_trait]
impl GenerationClient for SlowThenFailingClient {
    async fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedContent, GenerationError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(GeneratedContent {
                url: "https://generated.example/late.png".to_string(),
            })
        } else {
            Err(GenerationError::Status {
                status: 500,
                body: "boom".into(),
            })
        }
    }

    async fn health(&self) -> Result<(), GenerationError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn reclaimed_lease_does_not_let_a_late_run_write_the_owner() {
    let h = harness_with_queue(InMemoryTaskQueue::with_visibility_timeout(Duration::from_secs(1)));
    let submitted = h
        .pipeline
        .producer()
        .submit_background(ArtistId::new(42), BackgroundParams::default())
        .await
        .unwrap();
    let ctx = WorkerContext {
        generation: Arc::new(SlowThenFailingClient {
            calls: AtomicUsize::new(0),
        }),
        ..h.pipeline.worker_context()
    };

    let first = h.queue.dequeue("w0").await.unwrap();
    let slow_run = {
        let ctx = ctx.clone();
        tokio::spawn(async move { process_delivery(&ctx, first).await })
    };

    // the lease runs out while w0 is still generating
    let reclaimed = h.queue.dequeue("w1").await.unwrap();
    assert_eq!(reclaimed.delivery_count, 2);
    let fast = process_delivery(&ctx, reclaimed).await.unwrap();
    assert!(matches!(fast, Outcome::Failed { .. }));

    let late = slow_run.await.unwrap().unwrap();
    assert_eq!(late, Outcome::Discarded("job already FAILED".to_string()));

    let job = h.store.get(submitted[0].job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_url, None);
    assert_eq!(h.market.background_poster(ArtistId::new(42)), None);
}

#[tokio::test]
async fn unknown_job_id_reads_as_not_found() {
    let h = harness();
    let id = atelier_core::JobId::new();
    assert_eq!(h.pipeline.status().get_status(id).await, Err(StatusError::NotFound(id)));
}

#[tokio::test]
async fn unknown_owner_is_rejected_without_creating_jobs() {
    let h = harness();
    let err = h
        .pipeline
        .producer()
        .submit_background(ArtistId::new(999), BackgroundParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::OwnerNotFound { id: 999, .. }));
    assert!(h.store.is_empty());
    assert_eq!(h.queue.pending_count(), 0);
}

#[tokio::test]
async fn product_without_media_has_nothing_to_generate() {
    let h = harness();
    h.market.add_product(ProductShootContext {
        product_id: ProductId::new(8),
        art_form: "Weaving".into(),
        product_description: None,
        media: vec![],
    });

    let err = h
        .pipeline
        .producer()
        .submit_professional_shoot(ProductId::new(8))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::NothingToGenerate(id) if id == ProductId::new(8)));
    assert!(h.store.is_empty());
}

/// Queue that refuses every operation.
struct DownQueue;

#[async_trait]
impl TaskQueue for DownQueue {
    async fn enqueue(&self, _task: &Task) -> Result<TaskHandle, QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }

    async fn dequeue(&self, _consumer: &str) -> Result<Delivery, QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn enqueue_failure_revokes_the_job() {
    let h = harness();
    let pipeline = Pipeline::new(
        h.store.clone(),
        Arc::new(DownQueue),
        h.market.clone(),
        h.generation.clone(),
    );

    let err = pipeline
        .producer()
        .submit_background(ArtistId::new(42), BackgroundParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::Queue(QueueError::Unavailable(_))));
    assert!(h.store.is_empty(), "no PENDING job may be left without a task");
}

/// In-memory queue that refuses exactly the Nth enqueue.
struct FailNthEnqueue {
    inner: Arc<InMemoryTaskQueue>,
    fail_on: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl TaskQueue for FailNthEnqueue {
    async fn enqueue(&self, task: &Task) -> Result<TaskHandle, QueueError> {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(QueueError::Unavailable("stream write timed out".into()));
        }
        self.inner.enqueue(task).await
    }

    async fn dequeue(&self, consumer: &str) -> Result<Delivery, QueueError> {
        self.inner.dequeue(consumer).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.ack(delivery).await
    }
}

#[tokio::test]
async fn mid_batch_enqueue_failure_reports_the_surviving_jobs() {
    let h = harness();
    let queue = Arc::new(FailNthEnqueue {
        inner: h.queue.clone(),
        fail_on: 3,
        seen: AtomicUsize::new(0),
    });
    let pipeline = Pipeline::new(h.store.clone(), queue, h.market.clone(), h.generation.clone());

    let err = pipeline
        .producer()
        .submit_professional_shoot(ProductId::new(7))
        .await
        .unwrap_err();

    let SubmitError::Partial { submitted, source } = &err else {
        panic!("expected a partial submission, got {err:?}");
    };
    assert!(matches!(**source, SubmitError::Queue(QueueError::Unavailable(_))));
    let owners: Vec<OwnerRef> = submitted.iter().map(|s| s.owner).collect();
    assert_eq!(
        owners,
        vec![
            OwnerRef::product_image(ProductMediaId::new(101)),
            OwnerRef::product_image(ProductMediaId::new(102)),
        ]
    );
    assert_eq!(err.submitted().len(), 2);

    // the third unit's job was revoked; the first two are live and queued
    assert_eq!(h.store.len(), 2);
    assert!(
        h.store
            .list_for_owner(OwnerRef::product_image(ProductMediaId::new(103)), 10)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(h.queue.pending_count(), 2);

    let outcomes = drain(&h).await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| matches!(o, Outcome::Completed { .. })));
}

/// Client whose generate call panics.
struct PanickingClient;

#[async_trait]
impl GenerationClient for PanickingClient {
    async fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedContent, GenerationError> {
        panic!("inference client bug");
    }

    async fn health(&self) -> Result<(), GenerationError> {
        Ok(())
    }
}

#[tokio::test]
async fn panicking_handler_fails_the_job_and_keeps_the_worker_alive() {
    let h = harness();
    let submitted = h
        .pipeline
        .producer()
        .submit_background(ArtistId::new(42), BackgroundParams::default())
        .await
        .unwrap();

    let ctx = WorkerContext {
        generation: Arc::new(PanickingClient),
        ..h.pipeline.worker_context()
    };
    let delivery = h.queue.dequeue("w1").await.unwrap();
    let outcome = process_delivery(&ctx, delivery).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::Failed {
            reason: PANIC_REASON.to_string()
        }
    );
    let job = h.store.get(submitted[0].job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(h.queue.in_flight_count(), 0);
}

#[tokio::test]
async fn worker_pool_drains_the_queue_and_shuts_down() {
    let h = harness();
    let producer = h.pipeline.producer();
    let mut ids: Vec<_> = producer
        .submit_professional_shoot(ProductId::new(7))
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.job_id)
        .collect();
    ids.extend(
        producer
            .submit_background(ArtistId::new(42), BackgroundParams::default())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.job_id),
    );

    let config = WorkerConfig {
        pool_name: "it".into(),
        concurrency: 2,
        poll_backoff: Duration::from_millis(10),
    };
    let pool = spawn_worker_pool(h.pipeline.worker_context(), &config);

    let status = h.pipeline.status();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let summary = status.summarize(&ids).await.unwrap();
        if summary.is_settled() && pool.stats().processed == 4 {
            assert!(summary.all_completed(), "{summary:?}");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "pool did not drain: {summary:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = pool.stats();
    assert_eq!(stats.processed, 4);
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.errors, 0);
    pool.shutdown().await;

    let totals = status.stats().await.unwrap();
    assert_eq!(totals.completed, 4);
    assert_eq!(totals.pending, 0);
}
