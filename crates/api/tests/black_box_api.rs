use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

use atelier_core::{ArtistId, JobId, ProductId, ProductMediaId};
use atelier_generation::FakeGenerationClient;
use atelier_infra::config::WorkerConfig;
use atelier_infra::marketplace::{InMemoryMarketplace, ProductMedia, ProductShootContext, ProfileContext};
use atelier_infra::pipeline::{MAX_SUMMARY_IDS, Pipeline, WorkerPoolHandle, spawn_worker_pool};
use atelier_poller::{BatchEnd, HttpStatusSource, PollOutcome, PollPolicy, poll_batch, poll_job};
use atelier_queue::{Delivery, InMemoryTaskQueue, QueueError, Task, TaskHandle, TaskQueue};

struct TestServer {
    base_url: String,
    market: Arc<InMemoryMarketplace>,
    generation: Arc<FakeGenerationClient>,
    workers: Option<WorkerPoolHandle>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Same router as prod over in-memory backends, on an ephemeral port.
    async fn spawn(with_workers: bool) -> Self {
        Self::spawn_with(with_workers, |pipeline| pipeline).await
    }

    /// Like [`spawn`](Self::spawn), letting the caller swap pipeline parts.
    async fn spawn_with(with_workers: bool, customize: impl FnOnce(Pipeline) -> Pipeline) -> Self {
        let market = Arc::new(InMemoryMarketplace::new());
        market.add_profile(ProfileContext {
            artist_id: ArtistId::new(42),
            profession: "Potter".into(),
            active_description: None,
        });
        market.add_product(ProductShootContext {
            product_id: ProductId::new(7),
            art_form: "Stoneware".into(),
            product_description: None,
            media: (1..=3)
                .map(|i| ProductMedia {
                    id: ProductMediaId::new(i),
                    image_url: format!("https://cdn.example/raw/{i}.jpg"),
                })
                .collect(),
        });
        market.add_product(ProductShootContext {
            product_id: ProductId::new(8),
            art_form: "Stoneware".into(),
            product_description: None,
            media: vec![],
        });

        let generation = Arc::new(FakeGenerationClient::new());
        let pipeline = customize(Pipeline::in_memory(market.clone(), generation.clone()));

        let workers = with_workers.then(|| {
            spawn_worker_pool(
                pipeline.worker_context(),
                &WorkerConfig {
                    pool_name: "black-box".into(),
                    concurrency: 2,
                    poll_backoff: Duration::from_millis(10),
                },
            )
        });

        let app = atelier_api::app::build_app(Arc::new(atelier_api::app::AppServices::from_pipeline(&pipeline)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            market,
            generation,
            workers,
            handle,
        }
    }

    fn status_source(&self) -> HttpStatusSource {
        HttpStatusSource::new(Url::parse(&self.base_url).unwrap(), Duration::from_secs(5)).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(workers) = &self.workers {
            workers.cancellation_token().cancel();
        }
        self.handle.abort();
    }
}

fn job_ids(body: &Value) -> Vec<JobId> {
    body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["jobId"].as_str().unwrap().parse().unwrap())
        .collect()
}

fn fast_policy() -> PollPolicy {
    PollPolicy::new(Duration::from_millis(20), Duration::from_secs(5))
}

#[tokio::test]
async fn health_endpoints() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(format!("{}/health/ready", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    srv.generation.set_healthy(false);
    let res = client.get(format!("{}/health/ready", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_ready");
}

#[tokio::test]
async fn background_submission_is_accepted_then_completes() {
    let srv = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/profiles/42/background", srv.base_url))
        .json(&json!({"custom_req_text": "dusk"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["status"], "PENDING");
    assert_eq!(jobs[0]["ownerKind"], "PROFILE_BACKGROUND");
    assert_eq!(jobs[0]["ownerRef"], 42);

    let id = job_ids(&body)[0];
    let outcome = poll_job(&srv.status_source(), id, &fast_policy(), &CancellationToken::new()).await;
    let expected = "https://generated.example/background/potter.png";
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            result_url: expected.to_string()
        }
    );
    // the owner is updated before COMPLETED becomes visible
    assert_eq!(srv.market.background_poster(ArtistId::new(42)).as_deref(), Some(expected));

    let res = client.get(format!("{}/jobs/{}", srv.base_url, id)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let view: Value = res.json().await.unwrap();
    assert_eq!(view["status"], "COMPLETED");
    assert_eq!(view["resultUrl"], expected);
    assert!(view["createdAt"].is_string());
    assert!(view["updatedAt"].is_string());
}

#[tokio::test]
async fn professional_shoot_isolates_a_failed_image() {
    let srv = TestServer::spawn(true).await;
    srv.generation.fail_image("https://cdn.example/raw/3.jpg");
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/products/7/professional-shoot", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let ids = job_ids(&res.json().await.unwrap());
    assert_eq!(ids.len(), 3);

    let outcome = poll_batch(&srv.status_source(), &ids, &fast_policy(), &CancellationToken::new()).await;
    assert_eq!(outcome.end, BatchEnd::Settled);
    assert_eq!(outcome.completed.len(), 2);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, ids[2]);
    assert!(!outcome.all_completed());

    let res = client
        .post(format!("{}/jobs/summary", srv.base_url))
        .json(&json!({"job_ids": ids}))
        .send()
        .await
        .unwrap();
    let summary: Value = res.json().await.unwrap();
    assert_eq!(summary["completed"], 2);
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["pending"], 0);

    assert!(srv.market.generated_image(ProductMediaId::new(1)).is_some());
    assert!(srv.market.generated_image(ProductMediaId::new(2)).is_some());
    assert_eq!(srv.market.generated_image(ProductMediaId::new(3)), None);

    let res = client
        .get(format!(
            "{}/jobs?owner_kind=PRODUCT_IMAGE&owner_ref=3",
            srv.base_url
        ))
        .send()
        .await
        .unwrap();
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["status"], "FAILED");
}

#[tokio::test]
async fn without_workers_jobs_stay_pending_and_polling_times_out() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/profiles/42/background", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let id = job_ids(&res.json().await.unwrap())[0];

    let policy = PollPolicy::new(Duration::from_millis(20), Duration::from_millis(200));
    let outcome = poll_job(&srv.status_source(), id, &policy, &CancellationToken::new()).await;
    assert!(matches!(outcome, PollOutcome::TimedOut { .. }));

    let res = client.get(format!("{}/jobs/{}", srv.base_url, id)).send().await.unwrap();
    let view: Value = res.json().await.unwrap();
    assert_eq!(view["status"], "PENDING");
    assert!(view["resultUrl"].is_null());

    let res = client.get(format!("{}/jobs/stats", srv.base_url)).send().await.unwrap();
    let stats: Value = res.json().await.unwrap();
    assert_eq!(stats["pending"], 1);
}

#[tokio::test]
async fn error_mapping() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, JobId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client.get(format!("{}/jobs/not-a-uuid", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("{}/profiles/999/background", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "owner_not_found");

    let res = client
        .post(format!("{}/products/8/professional-shoot", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "nothing_to_generate");
}

/// In-memory queue that refuses exactly the Nth enqueue.
struct FailNthEnqueue {
    inner: InMemoryTaskQueue,
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
async fn partial_shoot_submission_lists_the_jobs_that_went_through() {
    let srv = TestServer::spawn_with(false, |pipeline| {
        Pipeline::new(
            pipeline.store,
            Arc::new(FailNthEnqueue {
                inner: InMemoryTaskQueue::new(),
                fail_on: 2,
                seen: AtomicUsize::new(0),
            }),
            pipeline.marketplace,
            pipeline.generation,
        )
    })
    .await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/products/7/professional-shoot", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "submission_failed");
    let submitted = body["submitted"].as_array().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0]["status"], "PENDING");
    assert_eq!(submitted[0]["ownerRef"], 1);

    // the listed job is live, the one whose enqueue failed was revoked
    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, submitted[0]["jobId"].as_str().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = client.get(format!("{}/jobs/stats", srv.base_url)).send().await.unwrap();
    let stats: Value = res.json().await.unwrap();
    assert_eq!(stats["pending"], 1);
    let res = client
        .get(format!("{}/jobs?owner_kind=PRODUCT_IMAGE&owner_ref=2", srv.base_url))
        .send()
        .await
        .unwrap();
    let listed: Value = res.json().await.unwrap();
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn oversized_summary_request_is_rejected() {
    let srv = TestServer::spawn(false).await;
    let ids: Vec<JobId> = (0..=MAX_SUMMARY_IDS).map(|_| JobId::new()).collect();

    let res = reqwest::Client::new()
        .post(format!("{}/jobs/summary", srv.base_url))
        .json(&json!({"job_ids": ids}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "too_many_job_ids");
}
