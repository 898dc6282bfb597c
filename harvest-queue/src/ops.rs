//! Low-level queue operations, generic over any sqlx executor so the
//! facade can compose them inside transactions where atomicity matters
//! (terminal failure + dead-letter insertion, replay).

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::{DeadLetter, Job, JobKind, JobOutcome, JobState, NewJob};

pub async fn create_job<'c, E>(executor: E, job: &NewJob) -> Result<Uuid, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let id = job.job_id.unwrap_or_else(Uuid::now_v7);
    let scheduled = Utc::now() + chrono::Duration::from_std(job.delay).unwrap_or_default();

    // ON CONFLICT DO NOTHING makes enqueues with a stable id idempotent.
    sqlx::query(
        r#"
INSERT INTO jobs
    (id, kind, state, priority, attempt, max_attempts, payload, correlation_id, scheduled)
VALUES
    ($1, $2, 'available'::job_state, $3, 0, $4, $5, $6, $7)
ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(job.kind)
    .bind(job.priority)
    .bind(job.max_attempts)
    .bind(Json(&job.payload))
    .bind(job.correlation_id)
    .bind(scheduled)
    .execute(executor)
    .await?;

    Ok(id)
}

/// Reserve the next ready job of `kind`, if any. The `FOR UPDATE SKIP
/// LOCKED` clause lets concurrent workers pull from the same queue without
/// serializing on each other. Reservation consumes an attempt and stamps
/// the lock used by every subsequent update.
pub async fn reserve_next<'c, E>(
    executor: E,
    kind: JobKind,
    worker_id: &str,
    lock_id: Uuid,
) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let job = sqlx::query_as::<_, Job>(
        r#"
WITH next AS (
    SELECT id
    FROM jobs
    WHERE
        state = 'available'::job_state
        AND kind = $1
        AND scheduled <= NOW()
        AND NOT EXISTS (
            SELECT 1 FROM queue_control
            WHERE queue_control.kind = $1 AND queue_control.paused
        )
    ORDER BY
        priority ASC,
        scheduled ASC,
        id ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE jobs
SET
    state = 'running'::job_state,
    attempt = jobs.attempt + 1,
    lock_id = $2,
    locked_by = $3,
    attempted_by = array_append(jobs.attempted_by, $3),
    last_heartbeat = NOW(),
    last_transition = NOW(),
    transition_count = jobs.transition_count + 1
FROM next
WHERE jobs.id = next.id
RETURNING jobs.*
        "#,
    )
    .bind(kind)
    .bind(lock_id)
    .bind(worker_id)
    .fetch_optional(executor)
    .await?;

    Ok(job)
}

/// Refresh the reservation and record progress. Fails with `InvalidLock`
/// when the reservation lapsed and the stall sweep reclaimed the job.
pub async fn touch_heartbeat<'c, E>(
    executor: E,
    job_id: Uuid,
    lock_id: Uuid,
    progress: Option<i16>,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE jobs
SET last_heartbeat = NOW(), progress = COALESCE($3, progress)
WHERE id = $1 AND lock_id = $2 AND state = 'running'::job_state
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .bind(progress)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(QueueError::InvalidLock {
            job: job_id,
            lock: lock_id,
        });
    }
    Ok(())
}

pub async fn mark_completed<'c, E>(
    executor: E,
    job_id: Uuid,
    lock_id: Uuid,
    outcome: &JobOutcome,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE jobs
SET
    state = 'completed'::job_state,
    result = $3,
    progress = 100,
    finished_at = NOW(),
    last_heartbeat = NULL,
    lock_id = NULL,
    locked_by = NULL,
    last_transition = NOW(),
    transition_count = transition_count + 1
WHERE id = $1 AND lock_id = $2 AND state = 'running'::job_state
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .bind(Json(outcome))
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(QueueError::InvalidLock {
            job: job_id,
            lock: lock_id,
        });
    }
    Ok(())
}

/// Return a failed-but-retryable job to the waiting set at `scheduled`,
/// appending the failure to the job's error history.
pub async fn reschedule_retry<'c, E>(
    executor: E,
    job_id: Uuid,
    lock_id: Uuid,
    scheduled: DateTime<Utc>,
    error: &serde_json::Value,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE jobs
SET
    state = 'available'::job_state,
    scheduled = $3,
    errors = jobs.errors || jsonb_build_array($4::jsonb),
    last_heartbeat = NULL,
    lock_id = NULL,
    locked_by = NULL,
    last_transition = NOW(),
    transition_count = transition_count + 1
WHERE id = $1 AND lock_id = $2 AND state = 'running'::job_state
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .bind(scheduled)
    .bind(Json(error))
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(QueueError::InvalidLock {
            job: job_id,
            lock: lock_id,
        });
    }
    Ok(())
}

/// Transition a job to its terminal failed state, returning the final row
/// so the caller can snapshot it into the dead-letter table within the
/// same transaction.
pub async fn mark_failed<'c, E>(
    executor: E,
    job_id: Uuid,
    lock_id: Uuid,
    error: &serde_json::Value,
) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let job = sqlx::query_as::<_, Job>(
        r#"
UPDATE jobs
SET
    state = 'failed'::job_state,
    errors = jobs.errors || jsonb_build_array($3::jsonb),
    finished_at = NOW(),
    last_heartbeat = NULL,
    lock_id = NULL,
    locked_by = NULL,
    last_transition = NOW(),
    transition_count = transition_count + 1
WHERE id = $1 AND lock_id = $2 AND state = 'running'::job_state
RETURNING jobs.*
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .bind(Json(error))
    .fetch_optional(executor)
    .await?;

    Ok(job)
}

pub async fn insert_dead_letter<'c, E>(
    executor: E,
    job: &Job,
    failure_reason: &str,
    failure_stack: Option<&str>,
) -> Result<Uuid, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let id = Uuid::now_v7();
    sqlx::query(
        r#"
INSERT INTO dead_letters
    (id, job_id, kind, payload, correlation_id, failure_reason, failure_stack, attempts_made)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(id)
    .bind(job.id)
    .bind(job.kind)
    .bind(&job.payload)
    .bind(job.correlation_id)
    .bind(failure_reason)
    .bind(failure_stack)
    .bind(job.attempt)
    .execute(executor)
    .await?;

    Ok(id)
}

/// Return a reserved job to the waiting set without consuming the attempt.
/// Used on cooperative cancellation, where the worker never got to run the
/// job to a verdict.
pub async fn release_job<'c, E>(executor: E, job_id: Uuid, lock_id: Uuid) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE jobs
SET
    state = 'available'::job_state,
    attempt = GREATEST(jobs.attempt - 1, 0),
    last_heartbeat = NULL,
    lock_id = NULL,
    locked_by = NULL,
    last_transition = NOW(),
    transition_count = transition_count + 1
WHERE id = $1 AND lock_id = $2 AND state = 'running'::job_state
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(QueueError::InvalidLock {
            job: job_id,
            lock: lock_id,
        });
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
pub struct DepthCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

pub async fn count_depths<'c, E>(executor: E, kind: JobKind) -> Result<DepthCounts, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let counts = sqlx::query_as::<_, DepthCounts>(
        r#"
SELECT
    COUNT(*) FILTER (WHERE state = 'available' AND scheduled <= NOW()) AS waiting,
    COUNT(*) FILTER (WHERE state = 'available' AND scheduled > NOW()) AS delayed,
    COUNT(*) FILTER (WHERE state = 'running') AS active,
    COUNT(*) FILTER (WHERE state = 'completed') AS completed,
    COUNT(*) FILTER (WHERE state = 'failed') AS failed
FROM jobs
WHERE kind = $1
        "#,
    )
    .bind(kind)
    .fetch_one(executor)
    .await?;

    Ok(counts)
}

pub async fn set_paused<'c, E>(executor: E, kind: JobKind, paused: bool) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO queue_control (kind, paused)
VALUES ($1, $2)
ON CONFLICT (kind) DO UPDATE SET paused = EXCLUDED.paused, updated_at = NOW()
        "#,
    )
    .bind(kind)
    .bind(paused)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn is_paused<'c, E>(executor: E, kind: JobKind) -> Result<bool, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let paused: Option<bool> =
        sqlx::query_scalar("SELECT paused FROM queue_control WHERE kind = $1")
            .bind(kind)
            .fetch_optional(executor)
            .await?;

    Ok(paused.unwrap_or(false))
}

/// Remove finished jobs of `state` older than `older_than`.
pub async fn clean_finished<'c, E>(
    executor: E,
    kind: JobKind,
    state: JobState,
    older_than: DateTime<Utc>,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
DELETE FROM jobs
WHERE kind = $1 AND state = $2 AND finished_at IS NOT NULL AND finished_at < $3
        "#,
    )
    .bind(kind)
    .bind(state)
    .bind(older_than)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Keep only the most recent `keep` finished jobs of `state` per kind; the
/// retained rows form the introspection ring.
pub async fn prune_finished_ring<'c, E>(
    executor: E,
    kind: JobKind,
    state: JobState,
    keep: i64,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
DELETE FROM jobs
WHERE kind = $1 AND state = $2 AND id NOT IN (
    SELECT id FROM jobs
    WHERE kind = $1 AND state = $2
    ORDER BY finished_at DESC NULLS LAST
    LIMIT $3
)
        "#,
    )
    .bind(kind)
    .bind(state)
    .bind(keep)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Jobs whose reservation lapsed without a heartbeat return to the waiting
/// set. The attempt consumed at reservation is not refunded.
pub async fn reset_stalled<'c, E>(
    executor: E,
    heartbeat_cutoff: DateTime<Utc>,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
WITH stalled AS (
    SELECT id FROM jobs
    WHERE state = 'running'::job_state AND COALESCE(last_heartbeat, $1) <= $1
    FOR UPDATE SKIP LOCKED
)
UPDATE jobs
SET
    state = 'available'::job_state,
    lock_id = NULL,
    locked_by = NULL,
    last_heartbeat = NULL,
    janitor_touch_count = jobs.janitor_touch_count + 1,
    last_transition = NOW(),
    transition_count = jobs.transition_count + 1
FROM stalled
WHERE jobs.id = stalled.id
        "#,
    )
    .bind(heartbeat_cutoff)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Jobs the stall sweep has already returned `max_touches` times are
/// quarantined to the dead-letter table instead of being handed out again.
pub async fn quarantine_poison_pills<'c, E>(
    executor: E,
    heartbeat_cutoff: DateTime<Utc>,
    max_touches: i16,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
WITH poisoned AS (
    SELECT id FROM jobs
    WHERE
        state = 'running'::job_state
        AND COALESCE(last_heartbeat, $1) <= $1
        AND janitor_touch_count >= $2
    FOR UPDATE SKIP LOCKED
),
failed AS (
    UPDATE jobs
    SET
        state = 'failed'::job_state,
        lock_id = NULL,
        locked_by = NULL,
        last_heartbeat = NULL,
        finished_at = NOW(),
        last_transition = NOW(),
        transition_count = jobs.transition_count + 1
    FROM poisoned
    WHERE jobs.id = poisoned.id
    RETURNING jobs.id, jobs.kind, jobs.payload, jobs.correlation_id, jobs.attempt
)
INSERT INTO dead_letters
    (id, job_id, kind, payload, correlation_id, failure_reason, attempts_made)
SELECT gen_random_uuid(), id, kind, payload, correlation_id,
       'job repeatedly stalled mid-flight and was quarantined', attempt
FROM failed
        "#,
    )
    .bind(heartbeat_cutoff)
    .bind(max_touches)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn get_job<'c, E>(executor: E, job_id: Uuid) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    Ok(job)
}

pub async fn list_dead_letters<'c, E>(
    executor: E,
    kind: JobKind,
    limit: i64,
    offset: i64,
) -> Result<Vec<DeadLetter>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let records = sqlx::query_as::<_, DeadLetter>(
        r#"
SELECT * FROM dead_letters
WHERE kind = $1
ORDER BY failed_at DESC
LIMIT $2 OFFSET $3
        "#,
    )
    .bind(kind)
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await?;

    Ok(records)
}
