use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::codec::{
    CleanupPayload, ExportPayload, LabelPayload, ProcessResultsPayload, ScrapePayload,
};
use crate::error::QueueError;
use crate::ops;
use crate::types::{DeadLetter, DlqStats, JobKind, NewJob};

/// Operator surface over quarantined jobs: enumerate, replay, sweep.
///
/// Insertion happens inside [`crate::Queue::fail`]; this manager only ever
/// reads and drains the table.
#[derive(Clone)]
pub struct DeadLetterManager {
    pool: PgPool,
}

impl DeadLetterManager {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_dead_letters(
        &self,
        kind: JobKind,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetter>, QueueError> {
        ops::list_dead_letters(&self.pool, kind, limit, offset).await
    }

    pub async fn stats(&self, kind: JobKind) -> Result<DlqStats, QueueError> {
        #[derive(sqlx::FromRow)]
        struct Totals {
            total: i64,
            oldest_failure: Option<DateTime<Utc>>,
            newest_failure: Option<DateTime<Utc>>,
        }

        let totals = sqlx::query_as::<_, Totals>(
            r#"
SELECT COUNT(*) AS total, MIN(failed_at) AS oldest_failure, MAX(failed_at) AS newest_failure
FROM dead_letters
WHERE kind = $1
            "#,
        )
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;

        let by_reason: Vec<(String, i64)> = sqlx::query_as(
            r#"
SELECT failure_reason, COUNT(*)
FROM dead_letters
WHERE kind = $1
GROUP BY failure_reason
ORDER BY COUNT(*) DESC
            "#,
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        Ok(DlqStats {
            total: totals.total,
            by_failure_reason: by_reason.into_iter().collect(),
            oldest_failure: totals.oldest_failure,
            newest_failure: totals.newest_failure,
        })
    }

    /// Re-enqueue the original payload onto its queue with a fresh attempt
    /// budget and remove the dead-letter record, atomically. The payload
    /// goes back through the codec, so a replay can never smuggle an
    /// invalid payload past validation.
    pub async fn replay(&self, kind: JobKind, dlq_id: Uuid) -> Result<Uuid, QueueError> {
        let mut txn = self.pool.begin().await?;

        let record = sqlx::query_as::<_, DeadLetter>(
            "SELECT * FROM dead_letters WHERE id = $1 AND kind = $2 FOR UPDATE",
        )
        .bind(dlq_id)
        .bind(kind)
        .fetch_optional(&mut *txn)
        .await?
        .ok_or(QueueError::UnknownDeadLetter(dlq_id))?;

        let mut job = rebuild_job(record.kind, &record.payload.0)?;
        // Keep the original trace: the replayed job continues the story of
        // the one that died.
        job.correlation_id = record.correlation_id;

        let new_id = ops::create_job(&mut *txn, &job).await?;
        sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(dlq_id)
            .execute(&mut *txn)
            .await?;

        txn.commit().await?;

        info!(dlq_id = %dlq_id, new_job_id = %new_id, kind = %kind, "dead letter replayed");
        metrics::counter!("dead_letters_replayed_total", &[("kind", kind.as_str())]).increment(1);
        Ok(new_id)
    }

    /// Bulk replay of dead letters whose failure reason contains
    /// `reason_substring` (case-insensitive), oldest first.
    pub async fn replay_by_reason(
        &self,
        kind: JobKind,
        reason_substring: &str,
        max_jobs: i64,
    ) -> Result<Vec<Uuid>, QueueError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
SELECT id FROM dead_letters
WHERE kind = $1 AND failure_reason ILIKE '%' || $2 || '%'
ORDER BY failed_at ASC
LIMIT $3
            "#,
        )
        .bind(kind)
        .bind(reason_substring)
        .bind(max_jobs)
        .fetch_all(&self.pool)
        .await?;

        let mut replayed = Vec::with_capacity(ids.len());
        for id in ids {
            replayed.push(self.replay(kind, id).await?);
        }
        Ok(replayed)
    }

    /// TTL cleanup of old records. Default retention is 30 days, driven by
    /// the janitor schedule.
    pub async fn sweep(&self, kind: JobKind, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let result = sqlx::query("DELETE FROM dead_letters WHERE kind = $1 AND failed_at < $2")
            .bind(kind)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn count(&self, kind: JobKind) -> Result<i64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE kind = $1")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Rebuild a validated `NewJob` from a dead letter's original payload.
fn rebuild_job(kind: JobKind, payload: &serde_json::Value) -> Result<NewJob, QueueError> {
    let job = match kind {
        JobKind::Scrape => ScrapePayload::from_value(payload)?.into_job()?,
        JobKind::Label => LabelPayload::from_value(payload)?.into_job()?,
        JobKind::ProcessResults => {
            let payload: ProcessResultsPayload = serde_json::from_value(payload.clone())
                .map_err(|e| crate::codec::CodecError::InvalidPayload(e.to_string()))?;
            payload.into_job()?
        }
        JobKind::Cleanup => {
            let payload: CleanupPayload = serde_json::from_value(payload.clone())
                .map_err(|e| crate::codec::CodecError::InvalidPayload(e.to_string()))?;
            payload.into_job()?
        }
        JobKind::Export => {
            let payload: ExportPayload = serde_json::from_value(payload.clone())
                .map_err(|e| crate::codec::CodecError::InvalidPayload(e.to_string()))?;
            payload.into_job()?
        }
    };
    Ok(job)
}
