use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use harvest_common::retry::RetryPolicy;

use crate::config::PoolConfig;
use crate::error::QueueError;
use crate::ops;
use crate::types::{Job, JobKind, JobOutcome, JobState, NewJob, QueueStats};

/// What happened to a failed job.
#[derive(Debug, PartialEq, Eq)]
pub enum FailDisposition {
    /// Rescheduled with backoff; retries remained.
    Retried,
    /// Quarantined: the dead-letter record id.
    DeadLettered(Uuid),
}

/// Facade over the per-kind logical queues.
///
/// Jobs handed out by [`Queue::reserve`] are consumed by the transition
/// methods (`complete`, `fail`, `release`) so a job object cannot be
/// transitioned twice.
#[derive(Clone)]
pub struct Queue {
    pool: PgPool,
    worker_id: String,
    retry_policy: RetryPolicy,
}

impl Queue {
    pub async fn new(config: &PoolConfig, worker_id: &str) -> Result<Self, QueueError> {
        let pool = config.connect().await?;
        Ok(Self::from_pool(pool, worker_id))
    }

    pub fn from_pool(pool: PgPool, worker_id: &str) -> Self {
        Self {
            pool,
            worker_id: worker_id.to_owned(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a validated job. Returns the job id, which is stable when
    /// the caller provided one (idempotent enqueue).
    pub async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        let kind = job.kind;
        let id = ops::create_job(&self.pool, &job).await?;
        metrics::counter!("jobs_enqueued_total", &[("kind", kind.as_str())]).increment(1);
        debug!(job_id = %id, kind = %kind, "job enqueued");
        Ok(id)
    }

    /// Reserve the next ready job of `kind`, if any. Returns `None` when
    /// the queue is empty or paused.
    pub async fn reserve(&self, kind: JobKind) -> Result<Option<Job>, QueueError> {
        let lock_id = Uuid::new_v4();
        ops::reserve_next(&self.pool, kind, &self.worker_id, lock_id).await
    }

    /// Refresh the reservation, forwarding processor progress (0-100).
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        lock_id: Uuid,
        progress: Option<u8>,
    ) -> Result<(), QueueError> {
        let progress = progress.map(|p| p.min(100) as i16);
        ops::touch_heartbeat(&self.pool, job_id, lock_id, progress).await
    }

    /// Acknowledge a job with its result.
    pub async fn complete(&self, job: Job, outcome: &JobOutcome) -> Result<(), QueueError> {
        ops::mark_completed(&self.pool, job.id, job.lock(), outcome).await?;
        metrics::counter!("jobs_completed_total", &[("kind", job.kind.as_str())]).increment(1);
        Ok(())
    }

    /// Negatively acknowledge a job. With `retry` and attempts remaining
    /// the job is rescheduled with backoff; otherwise it transitions to
    /// `failed` and the dead-letter snapshot is written in the same
    /// transaction, so the job can never be lost between the queue and the
    /// DLQ nor appear in both.
    pub async fn fail(
        &self,
        job: Job,
        reason: &str,
        stack: Option<&str>,
        retry: bool,
        preferred_delay: Option<Duration>,
    ) -> Result<FailDisposition, QueueError> {
        let error_entry = json!({
            "attempt": job.attempt,
            "error": reason,
            "at": Utc::now(),
        });

        if retry && job.retries_remaining() {
            let delay = self
                .retry_policy
                .time_until_next_retry(job.attempt as u32, preferred_delay);
            let scheduled = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            ops::reschedule_retry(&self.pool, job.id, job.lock(), scheduled, &error_entry).await?;
            metrics::counter!("jobs_retried_total", &[("kind", job.kind.as_str())]).increment(1);
            debug!(job_id = %job.id, attempt = job.attempt, ?delay, "job rescheduled for retry");
            return Ok(FailDisposition::Retried);
        }

        let mut txn = self.pool.begin().await?;
        let failed = ops::mark_failed(&mut *txn, job.id, job.lock(), &error_entry)
            .await?
            .ok_or(QueueError::InvalidLock {
                job: job.id,
                lock: job.lock(),
            })?;
        let dlq_id = ops::insert_dead_letter(&mut *txn, &failed, reason, stack).await?;
        txn.commit().await?;

        metrics::counter!("jobs_dead_lettered_total", &[("kind", job.kind.as_str())]).increment(1);
        Ok(FailDisposition::DeadLettered(dlq_id))
    }

    /// Return a job to the waiting set without consuming its attempt.
    /// Used when a processor was cancelled before reaching a verdict.
    pub async fn release(&self, job: Job) -> Result<(), QueueError> {
        ops::release_job(&self.pool, job.id, job.lock()).await
    }

    pub async fn stats(&self, kind: JobKind) -> Result<QueueStats, QueueError> {
        let depths = ops::count_depths(&self.pool, kind).await?;
        let paused = ops::is_paused(&self.pool, kind).await?;
        Ok(QueueStats {
            waiting: depths.waiting,
            delayed: depths.delayed,
            active: depths.active,
            completed: depths.completed,
            failed: depths.failed,
            paused,
        })
    }

    /// Block new reservations for `kind`; in-flight jobs keep running.
    pub async fn pause(&self, kind: JobKind) -> Result<(), QueueError> {
        ops::set_paused(&self.pool, kind, true).await
    }

    pub async fn resume(&self, kind: JobKind) -> Result<(), QueueError> {
        ops::set_paused(&self.pool, kind, false).await
    }

    pub async fn is_paused(&self, kind: JobKind) -> Result<bool, QueueError> {
        ops::is_paused(&self.pool, kind).await
    }

    /// Remove finished jobs older than `older_than`.
    pub async fn clean(
        &self,
        kind: JobKind,
        state: JobState,
        older_than: Duration,
    ) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        ops::clean_finished(&self.pool, kind, state, cutoff).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        ops::get_job(&self.pool, job_id).await
    }
}
