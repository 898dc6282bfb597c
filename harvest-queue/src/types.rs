use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// A named category of work with a fixed payload schema and processor.
/// One logical queue exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
pub enum JobKind {
    Scrape,
    Label,
    ProcessResults,
    Cleanup,
    Export,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Scrape,
        JobKind::Label,
        JobKind::ProcessResults,
        JobKind::Cleanup,
        JobKind::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scrape => "scrape",
            JobKind::Label => "label",
            JobKind::ProcessResults => "process_results",
            JobKind::Cleanup => "cleanup",
            JobKind::Export => "export",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(JobKind::Scrape),
            "label" => Ok(JobKind::Label),
            "process_results" => Ok(JobKind::ProcessResults),
            "cleanup" => Ok(JobKind::Cleanup),
            "export" => Ok(JobKind::Export),
            other => Err(format!("{} is not a valid job kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "job_state", rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in the queue (or delayed, when `scheduled` is in the future).
    Available,
    /// Reserved by a worker holding a live lock.
    Running,
    /// Finished successfully; retained for introspection, pruned later.
    Completed,
    /// Exhausted its attempts; a dead-letter snapshot exists.
    Failed,
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobState::Available),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("{} is not a valid job state", other)),
        }
    }
}

/// A queue row as reserved by a worker.
#[derive(Debug, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub state: JobState,
    /// Lower is more urgent; used as a tie-break among ready jobs.
    pub priority: i16,
    /// 1-based on a reserved job: reservation consumes the attempt.
    pub attempt: i32,
    pub max_attempts: i32,
    /// Kind-typed payload, validated at enqueue time.
    pub payload: Json<serde_json::Value>,
    pub result: Option<Json<serde_json::Value>>,
    /// One entry per failed attempt: `{attempt, error, at}`.
    pub errors: Json<serde_json::Value>,
    pub progress: i16,
    pub correlation_id: Uuid,
    pub lock_id: Option<Uuid>,
    pub locked_by: Option<String>,
    pub attempted_by: Vec<String>,
    pub janitor_touch_count: i16,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub scheduled: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub last_transition: DateTime<Utc>,
    pub transition_count: i16,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The lock issued at reservation. Only reserved jobs are handed to
    /// callers, so the lock is always present on them.
    pub fn lock(&self) -> Uuid {
        self.lock_id
            .expect("reserved job is missing its lock id, this is a queue bug")
    }

    pub fn retries_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Everything needed to enqueue a job. Construct through the typed
/// constructors on the codec payloads so validation cannot be skipped.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub priority: i16,
    pub max_attempts: i32,
    pub delay: Duration,
    pub correlation_id: Uuid,
    /// Stable id for idempotent enqueues by correlation key; generated
    /// when absent.
    pub job_id: Option<Uuid>,
}

impl NewJob {
    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// The result envelope every processor returns, stored on the job row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: u64,
    pub items_processed: u64,
}

impl JobOutcome {
    pub fn success(data: serde_json::Value, items_processed: u64) -> Self {
        Self {
            success: true,
            message: None,
            data,
            error: None,
            processing_time_ms: 0,
            items_processed,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Point-in-time depth counters for one queue.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub paused: bool,
}

/// Snapshot of a job that exhausted its retries, preserved for replay.
#[derive(Debug, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: Uuid,
    pub job_id: Uuid,
    pub kind: JobKind,
    /// The original payload verbatim, so an operator can always re-enqueue.
    pub payload: Json<serde_json::Value>,
    pub correlation_id: Uuid,
    pub failure_reason: String,
    pub failure_stack: Option<String>,
    pub attempts_made: i32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DlqStats {
    pub total: i64,
    pub by_failure_reason: BTreeMap<String, i64>,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub newest_failure: Option<DateTime<Utc>>,
}
