use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::dlq::DeadLetterManager;
use crate::error::QueueError;
use crate::ops;
use crate::types::{JobKind, JobState};

/// Maintenance settings; defaults match the worker defaults (5 minute
/// visibility timeout, 30 day dead-letter retention).
#[derive(Debug, Clone)]
pub struct JanitorSettings {
    /// Reservations without a heartbeat for this long are considered
    /// stalled. Should match the workers' visibility timeout.
    pub stall_timeout: Duration,
    /// Stall recoveries tolerated before a job is quarantined.
    pub max_touches: i16,
    /// Completed jobs retained per kind for introspection.
    pub keep_completed: i64,
    /// Failed jobs retained per kind for introspection.
    pub keep_failed: i64,
    /// Dead letters older than this are swept.
    pub dead_letter_retention: Duration,
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(300),
            max_touches: 3,
            keep_completed: 50,
            keep_failed: 100,
            dead_letter_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JanitorOutcome {
    pub poisoned: u64,
    pub stalled_reset: u64,
    pub completed_pruned: u64,
    pub failed_pruned: u64,
    pub dead_letters_swept: u64,
}

/// Periodic queue maintenance: recover stalled reservations, quarantine
/// poison pills, prune the finished-job rings and expire old dead letters.
pub struct QueueJanitor {
    pool: PgPool,
    dead_letters: DeadLetterManager,
    settings: JanitorSettings,
}

impl QueueJanitor {
    pub fn from_pool(pool: PgPool, settings: JanitorSettings) -> Self {
        let dead_letters = DeadLetterManager::from_pool(pool.clone());
        Self {
            pool,
            dead_letters,
            settings,
        }
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../migrations").run(&self.pool).await
    }

    pub async fn run_once(&self) -> Result<JanitorOutcome, QueueError> {
        info!("janitor pass starting");
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.settings.stall_timeout).unwrap_or_default();

        // Quarantine before resetting, so repeat offenders do not get yet
        // another round trip through the waiting set.
        let poisoned =
            ops::quarantine_poison_pills(&self.pool, cutoff, self.settings.max_touches).await?;
        if poisoned > 0 {
            warn!(poisoned, "quarantined poison pills");
        }

        let stalled_reset = ops::reset_stalled(&self.pool, cutoff).await?;
        if stalled_reset > 0 {
            warn!(stalled_reset, "reset stalled reservations");
        }

        let mut completed_pruned = 0;
        let mut failed_pruned = 0;
        let mut dead_letters_swept = 0;
        for kind in JobKind::ALL {
            completed_pruned += ops::prune_finished_ring(
                &self.pool,
                kind,
                JobState::Completed,
                self.settings.keep_completed,
            )
            .await?;
            failed_pruned += ops::prune_finished_ring(
                &self.pool,
                kind,
                JobState::Failed,
                self.settings.keep_failed,
            )
            .await?;
            dead_letters_swept += self
                .dead_letters
                .sweep(kind, self.settings.dead_letter_retention)
                .await?;
        }

        let outcome = JanitorOutcome {
            poisoned,
            stalled_reset,
            completed_pruned,
            failed_pruned,
            dead_letters_swept,
        };
        info!(?outcome, "janitor pass complete");

        metrics::counter!("janitor_stalled_reset_total").increment(stalled_reset);
        metrics::counter!("janitor_poisoned_total").increment(poisoned);
        metrics::counter!("janitor_dead_letters_swept_total").increment(dead_letters_swept);

        Ok(outcome)
    }
}
