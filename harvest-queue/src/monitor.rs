use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dlq::DeadLetterManager;
use crate::error::QueueError;
use crate::queue::Queue;
use crate::types::{DlqStats, JobKind, QueueStats};

/// One observation of the whole queueing system, for the ops surface and
/// for the Prometheus gauges.
#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub timestamp: DateTime<Utc>,
    pub queues: BTreeMap<String, QueueStats>,
    pub dead_letter_queues: BTreeMap<String, DlqStats>,
    pub summary: SnapshotSummary,
}

#[derive(Debug, Serialize, Default)]
pub struct SnapshotSummary {
    pub total_active: i64,
    pub total_waiting: i64,
    pub total_delayed: i64,
    pub total_failed: i64,
    pub total_dead_lettered: i64,
}

/// Produces queue-depth snapshots from the facade and DLQ manager.
pub struct QueueMonitor {
    queue: Queue,
    dead_letters: DeadLetterManager,
}

impl QueueMonitor {
    pub fn new(queue: Queue, dead_letters: DeadLetterManager) -> Self {
        Self {
            queue,
            dead_letters,
        }
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let mut queues = BTreeMap::new();
        let mut dead_letter_queues = BTreeMap::new();
        let mut summary = SnapshotSummary::default();

        for kind in JobKind::ALL {
            let stats = self.queue.stats(kind).await?;
            summary.total_active += stats.active;
            summary.total_waiting += stats.waiting;
            summary.total_delayed += stats.delayed;
            summary.total_failed += stats.failed;
            queues.insert(kind.to_string(), stats);

            let dlq_stats = self.dead_letters.stats(kind).await?;
            summary.total_dead_lettered += dlq_stats.total;
            dead_letter_queues.insert(format!("{}_dlq", kind), dlq_stats);
        }

        Ok(QueueSnapshot {
            timestamp: Utc::now(),
            queues,
            dead_letter_queues,
            summary,
        })
    }

    /// Publish the snapshot as flat Prometheus gauges.
    pub fn publish(&self, snapshot: &QueueSnapshot) {
        for (kind, stats) in &snapshot.queues {
            for (state, value) in [
                ("waiting", stats.waiting),
                ("delayed", stats.delayed),
                ("active", stats.active),
                ("completed", stats.completed),
                ("failed", stats.failed),
            ] {
                metrics::gauge!(
                    "queue_depth",
                    &[("kind", kind.clone()), ("state", state.to_string())]
                )
                .set(value as f64);
            }
            metrics::gauge!("queue_paused", &[("kind", kind.clone())])
                .set(if stats.paused { 1.0 } else { 0.0 });
        }
        for (dlq, stats) in &snapshot.dead_letter_queues {
            metrics::gauge!("dead_letter_depth", &[("queue", dlq.clone())])
                .set(stats.total as f64);
        }
    }
}
