use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;

use harvest_queue::{
    FailDisposition, JanitorOutcome, JanitorSettings, JobKind, JobOutcome, JobState, Queue,
    QueueError, QueueJanitor, ScrapePayload,
};

fn scrape_payload() -> ScrapePayload {
    ScrapePayload::from_value(&json!({
        "app_id": "737534985",
        "countries": ["us", "gb"],
        "pages": 2,
        "throttle_ms": 100,
    }))
    .expect("payload should validate")
}

#[sqlx::test(migrations = "../migrations")]
async fn enqueue_then_reserve_round_trips(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    let payload = scrape_payload();
    let job = payload.clone().into_job().unwrap();
    let correlation_id = job.correlation_id;
    let priority = job.priority;

    let id = queue.enqueue(job).await.unwrap();
    let reserved = queue
        .reserve(JobKind::Scrape)
        .await
        .unwrap()
        .expect("job should be ready");

    assert_eq!(reserved.id, id);
    assert_eq!(reserved.state, JobState::Running);
    assert_eq!(reserved.attempt, 1);
    assert_eq!(reserved.max_attempts, 3);
    assert_eq!(reserved.priority, priority);
    assert_eq!(reserved.correlation_id, correlation_id);
    assert!(reserved.attempted_by.contains(&"test-worker".to_string()));
    assert!(reserved.lock_id.is_some());

    let round_tripped = ScrapePayload::from_value(&reserved.payload.0).unwrap();
    assert_eq!(round_tripped, payload);
}

#[sqlx::test(migrations = "../migrations")]
async fn empty_queue_reserves_none(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    assert!(queue.reserve(JobKind::Scrape).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../migrations")]
async fn delayed_jobs_are_invisible_until_due(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    let job = scrape_payload()
        .into_job()
        .unwrap()
        .with_delay(Duration::from_secs(3600));
    queue.enqueue(job).await.unwrap();

    assert!(queue.reserve(JobKind::Scrape).await.unwrap().is_none());

    let stats = queue.stats(JobKind::Scrape).await.unwrap();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.delayed, 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn lower_priority_value_wins_the_tie_break(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");

    let relaxed = ScrapePayload::from_value(&json!({
        "app_id": "100", "countries": ["us"], "priority": 9,
    }))
    .unwrap();
    let urgent = ScrapePayload::from_value(&json!({
        "app_id": "200", "countries": ["us"], "priority": 1,
    }))
    .unwrap();

    queue.enqueue(relaxed.into_job().unwrap()).await.unwrap();
    let urgent_id = queue.enqueue(urgent.into_job().unwrap()).await.unwrap();

    let first = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    assert_eq!(first.id, urgent_id);
}

#[sqlx::test(migrations = "../migrations")]
async fn stable_job_id_makes_enqueue_idempotent(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    let job_id = uuid::Uuid::new_v4();

    let first = scrape_payload().into_job().unwrap().with_job_id(job_id);
    let second = scrape_payload().into_job().unwrap().with_job_id(job_id);
    queue.enqueue(first).await.unwrap();
    queue.enqueue(second).await.unwrap();

    let stats = queue.stats(JobKind::Scrape).await.unwrap();
    assert_eq!(stats.waiting, 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn complete_stores_the_result(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    let id = queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();
    let job = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();

    let outcome = JobOutcome::success(json!({"reviews_scraped": 4}), 4);
    queue.complete(job, &outcome).await.unwrap();

    let stored = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.progress, 100);
    assert!(stored.finished_at.is_some());
    let result = stored.result.unwrap();
    assert_eq!(result.0["data"]["reviews_scraped"], 4);

    let stats = queue.stats(JobKind::Scrape).await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.active, 0);
}

#[sqlx::test(migrations = "../migrations")]
async fn retryable_failure_goes_back_to_the_queue_with_backoff(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    let id = queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();
    let job = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();

    let disposition = queue
        .fail(job, "catalog timed out", None, true, None)
        .await
        .unwrap();
    assert_eq!(disposition, FailDisposition::Retried);

    let stored = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Available);
    assert_eq!(stored.attempt, 1);
    // Base 2s backoff with jitter: strictly in the future.
    assert!(stored.scheduled > chrono::Utc::now());

    let stats = queue.stats(JobKind::Scrape).await.unwrap();
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.failed, 0);
}

#[sqlx::test(migrations = "../migrations")]
async fn exhausted_attempts_land_exactly_once_in_the_dlq(db: PgPool) {
    let queue = Queue::from_pool(db.clone(), "test-worker");
    let payload = ScrapePayload::from_value(&json!({
        "app_id": "737534985", "countries": ["us"], "max_attempts": 1,
    }))
    .unwrap();
    let id = queue.enqueue(payload.into_job().unwrap()).await.unwrap();
    let job = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();

    // retry requested, but the single attempt is spent.
    let disposition = queue
        .fail(job, "catalog timed out", None, true, None)
        .await
        .unwrap();
    assert!(matches!(disposition, FailDisposition::DeadLettered(_)));

    let stored = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);

    let dlq_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(dlq_count, 1);
    assert!(queue.reserve(JobKind::Scrape).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../migrations")]
async fn permanent_failure_skips_remaining_retries(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();
    let job = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    assert!(job.retries_remaining());

    let disposition = queue
        .fail(job, "invalid payload: bad app id", None, false, None)
        .await
        .unwrap();
    assert!(matches!(disposition, FailDisposition::DeadLettered(_)));
}

#[sqlx::test(migrations = "../migrations")]
async fn release_refunds_the_attempt(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();

    let job = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    assert_eq!(job.attempt, 1);
    queue.release(job).await.unwrap();

    let again = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    assert_eq!(again.attempt, 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn paused_queue_blocks_new_reservations(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();

    queue.pause(JobKind::Scrape).await.unwrap();
    assert!(queue.is_paused(JobKind::Scrape).await.unwrap());
    assert!(queue.reserve(JobKind::Scrape).await.unwrap().is_none());
    assert!(queue.stats(JobKind::Scrape).await.unwrap().paused);

    queue.resume(JobKind::Scrape).await.unwrap();
    assert!(queue.reserve(JobKind::Scrape).await.unwrap().is_some());
}

#[sqlx::test(migrations = "../migrations")]
async fn heartbeat_forwards_progress_and_checks_the_lock(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    let id = queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();
    let job = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    let lock = job.lock_id.unwrap();

    queue.heartbeat(id, lock, Some(42)).await.unwrap();
    let stored = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 42);

    let bogus_lock = uuid::Uuid::new_v4();
    let err = queue.heartbeat(id, bogus_lock, None).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidLock { .. }));
}

#[sqlx::test(migrations = "../migrations")]
async fn stall_sweep_returns_lapsed_reservations(db: PgPool) {
    let queue = Queue::from_pool(db.clone(), "test-worker");
    queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();
    let job = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    let lock = job.lock_id.unwrap();

    let janitor = QueueJanitor::from_pool(
        db,
        JanitorSettings {
            stall_timeout: Duration::ZERO,
            ..JanitorSettings::default()
        },
    );
    let outcome = janitor.run_once().await.unwrap();
    assert_eq!(
        outcome,
        JanitorOutcome {
            stalled_reset: 1,
            ..JanitorOutcome::default()
        }
    );

    // The old lock is dead; the job is reservable again and the attempt
    // consumed by the lapsed reservation stays consumed.
    let err = queue.heartbeat(job.id, lock, None).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidLock { .. }));

    let again = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    assert_eq!(again.attempt, 2);
}

#[sqlx::test(migrations = "../migrations")]
async fn repeatedly_stalling_job_is_quarantined(db: PgPool) {
    let queue = Queue::from_pool(db.clone(), "test-worker");
    queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();
    let janitor = QueueJanitor::from_pool(
        db.clone(),
        JanitorSettings {
            stall_timeout: Duration::ZERO,
            max_touches: 1,
            ..JanitorSettings::default()
        },
    );

    queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    let first_pass = janitor.run_once().await.unwrap();
    assert_eq!(first_pass.stalled_reset, 1);
    assert_eq!(first_pass.poisoned, 0);

    queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    let second_pass = janitor.run_once().await.unwrap();
    assert_eq!(second_pass.poisoned, 1);

    let dlq_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(dlq_count, 1);
    assert!(queue.reserve(JobKind::Scrape).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../migrations")]
async fn clean_removes_old_finished_jobs(db: PgPool) {
    let queue = Queue::from_pool(db, "test-worker");
    queue
        .enqueue(scrape_payload().into_job().unwrap())
        .await
        .unwrap();
    let job = queue.reserve(JobKind::Scrape).await.unwrap().unwrap();
    queue
        .complete(job, &JobOutcome::success(json!({}), 0))
        .await
        .unwrap();

    let removed = queue
        .clean(JobKind::Scrape, JobState::Completed, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(queue.stats(JobKind::Scrape).await.unwrap().completed, 0);
}
