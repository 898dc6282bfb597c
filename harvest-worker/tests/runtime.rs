use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use harvest_common::health::HealthRegistry;
use harvest_common::ratelimit::RateLimit;
use harvest_common::retry::RetryPolicy;
use harvest_queue::{Job, JobKind, JobOutcome, JobState, Queue, ScrapePayload};
use harvest_worker::error::JobError;
use harvest_worker::runtime::{JobProcessor, ProgressHandle, WorkerRuntime, WorkerSettings};

enum Behavior {
    Succeed,
    FailTransient,
    BlockUntilCancelled,
}

struct TestProcessor {
    behavior: Behavior,
}

#[async_trait]
impl JobProcessor for TestProcessor {
    fn kind(&self) -> JobKind {
        JobKind::Scrape
    }

    async fn process(
        &self,
        _job: &Job,
        progress: ProgressHandle,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        match self.behavior {
            Behavior::Succeed => {
                progress.report(100);
                Ok(JobOutcome::success(json!({"ok": true}), 1))
            }
            Behavior::FailTransient => Err(JobError::Transient("catalog unreachable".to_owned())),
            Behavior::BlockUntilCancelled => {
                cancel.cancelled().await;
                Err(JobError::Cancelled)
            }
        }
    }
}

fn settings(shutdown_grace: Duration) -> WorkerSettings {
    WorkerSettings {
        kind: JobKind::Scrape,
        concurrency: 2,
        rate_limit: RateLimit {
            max_tokens: 100,
            window: Duration::from_secs(60),
        },
        poll_interval: Duration::from_millis(50),
        visibility_timeout: Duration::from_secs(60),
        shutdown_grace,
    }
}

fn instant_retry_queue(db: PgPool) -> Queue {
    // Zero backoff so retries are immediately reservable.
    Queue::from_pool(db, "runtime-test")
        .with_retry_policy(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO))
}

async fn enqueue_scrape(queue: &Queue) -> uuid::Uuid {
    let payload = ScrapePayload::from_value(&json!({
        "app_id": "737534985",
        "countries": ["us"],
    }))
    .unwrap();
    queue.enqueue(payload.into_job().unwrap()).await.unwrap()
}

async fn start_runtime(
    queue: Queue,
    behavior: Behavior,
    shutdown_grace: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let registry = HealthRegistry::new("liveness");
    let liveness = registry
        .register("scrape-worker".to_owned(), chrono::Duration::seconds(60))
        .await;
    let runtime = WorkerRuntime::new(
        queue,
        Arc::new(TestProcessor { behavior }),
        settings(shutdown_grace),
        liveness,
        shutdown,
    );
    tokio::spawn(async move { runtime.run().await })
}

async fn eventually<F, Fut>(deadline: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within {:?}", deadline);
}

#[sqlx::test(migrations = "../migrations")]
async fn completes_jobs_end_to_end(db: PgPool) {
    let queue = instant_retry_queue(db);
    let job_id = enqueue_scrape(&queue).await;

    let shutdown = CancellationToken::new();
    let runtime = start_runtime(
        queue.clone(),
        Behavior::Succeed,
        Duration::from_secs(5),
        shutdown.clone(),
    )
    .await;

    eventually(Duration::from_secs(10), || {
        let queue = queue.clone();
        async move {
            matches!(
                queue.get_job(job_id).await.unwrap(),
                Some(job) if job.state == JobState::Completed
            )
        }
    })
    .await;

    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.progress, 100);
    let result = job.result.unwrap();
    assert_eq!(result.0["success"], true);
    assert_eq!(result.0["items_processed"], 1);

    shutdown.cancel();
    runtime.await.unwrap();
}

#[sqlx::test(migrations = "../migrations")]
async fn transient_failures_exhaust_attempts_into_the_dlq(db: PgPool) {
    let queue = instant_retry_queue(db.clone());
    let job_id = enqueue_scrape(&queue).await;

    let shutdown = CancellationToken::new();
    let runtime = start_runtime(
        queue.clone(),
        Behavior::FailTransient,
        Duration::from_secs(5),
        shutdown.clone(),
    )
    .await;

    eventually(Duration::from_secs(10), || {
        let db = db.clone();
        async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
                .fetch_one(&db)
                .await
                .unwrap();
            count == 1
        }
    })
    .await;

    shutdown.cancel();
    runtime.await.unwrap();

    // waiting -> active -> ... -> failed -> dead, exactly once in the DLQ.
    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 3);

    let (attempts, reason): (i32, String) = sqlx::query_as(
        "SELECT attempts_made, failure_reason FROM dead_letters WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_one(&db)
    .await
    .unwrap();
    assert_eq!(attempts, 3);
    assert!(reason.contains("catalog unreachable"));

    assert!(queue.reserve(JobKind::Scrape).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../migrations")]
async fn shutdown_releases_inflight_jobs_without_consuming_the_attempt(db: PgPool) {
    let queue = instant_retry_queue(db);
    let job_id = enqueue_scrape(&queue).await;

    let shutdown = CancellationToken::new();
    let runtime = start_runtime(
        queue.clone(),
        Behavior::BlockUntilCancelled,
        Duration::from_millis(200),
        shutdown.clone(),
    )
    .await;

    eventually(Duration::from_secs(10), || {
        let queue = queue.clone();
        async move {
            matches!(
                queue.get_job(job_id).await.unwrap(),
                Some(job) if job.state == JobState::Running
            )
        }
    })
    .await;

    shutdown.cancel();
    runtime.await.unwrap();

    // After the grace window the job was cancelled cooperatively and
    // released: back to waiting, attempt refunded, no lock held.
    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Available);
    assert_eq!(job.attempt, 0);
    assert!(job.lock_id.is_none());

    let stats = queue.stats(JobKind::Scrape).await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.waiting, 1);
}
