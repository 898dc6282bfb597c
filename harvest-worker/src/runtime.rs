//! Generic reservation loop: one runtime per job kind, `concurrency`
//! parallel slots, token-bucket rate limiting ahead of reservation,
//! heartbeats with progress forwarding, cooperative cancellation and a
//! bounded drain on shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use harvest_common::context::CorrelationContext;
use harvest_common::health::HealthHandle;
use harvest_common::ratelimit::{RateLimit, TokenBucket};
use harvest_queue::{Job, JobKind, JobOutcome, Queue, QueueError};

use crate::error::JobError;

/// Per-kind worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub kind: JobKind,
    pub concurrency: usize,
    pub rate_limit: RateLimit,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl WorkerSettings {
    /// Heartbeats must land well inside the visibility timeout or the
    /// stall sweep will reclaim a healthy job.
    pub fn heartbeat_interval(&self) -> Duration {
        std::cmp::min(Duration::from_secs(30), self.visibility_timeout / 4)
    }
}

/// Progress reporter handed to processors; forwarded on every heartbeat.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<u8>>,
}

impl ProgressHandle {
    pub(crate) fn new(tx: watch::Sender<u8>) -> Self {
        Self { tx: Arc::new(tx) }
    }

    /// Record overall progress, 0-100.
    pub fn report(&self, percent: u8) {
        let _ = self.tx.send(percent.min(100));
    }
}

/// A typed job processor. Implementations must watch `cancel` at their
/// suspension points and return [`JobError::Cancelled`] promptly; the
/// attempt is refunded in that case.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    async fn process(
        &self,
        job: &Job,
        progress: ProgressHandle,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, JobError>;
}

/// Reservation loop for one job kind.
pub struct WorkerRuntime<P> {
    queue: Queue,
    processor: Arc<P>,
    settings: WorkerSettings,
    limiter: Arc<TokenBucket>,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl<P: JobProcessor> WorkerRuntime<P> {
    pub fn new(
        queue: Queue,
        processor: Arc<P>,
        settings: WorkerSettings,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(TokenBucket::new(settings.rate_limit));
        Self {
            queue,
            processor,
            settings,
            limiter,
            liveness,
            shutdown,
        }
    }

    /// Run until shutdown, then drain. In-flight jobs get
    /// `shutdown_grace` to finish before they are cancelled cooperatively;
    /// anything that still does not come back is left to the
    /// stalled-reservation sweep.
    pub async fn run(&self) {
        let kind = self.settings.kind;
        let concurrency = self.settings.concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let in_flight = CancellationToken::new();

        info!(kind = %kind, concurrency, "worker runtime starting");

        loop {
            metrics::gauge!("worker_saturation_percent", &[("kind", kind.as_str())])
                .set(1f64 - semaphore.available_permits() as f64 / concurrency as f64);

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("worker semaphore has been closed")
                }
            };

            // Take the rate-limit token before reserving, so a job is
            // never held hostage waiting out the rate budget.
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
                _ = self.limiter.acquire() => {}
            }

            let job = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
                job = self.wait_for_job() => job,
            };

            metrics::counter!("jobs_started_total", &[("kind", kind.as_str())]).increment(1);

            let queue = self.queue.clone();
            let processor = self.processor.clone();
            let limiter = self.limiter.clone();
            let job_cancel = in_flight.child_token();
            let heartbeat_interval = self.settings.heartbeat_interval();

            tokio::spawn(async move {
                run_job(queue, processor, limiter, job, job_cancel, heartbeat_interval).await;
                drop(permit);
            });
        }

        info!(kind = %kind, "worker runtime draining");
        let all_permits = concurrency as u32;
        let drained =
            tokio::time::timeout(self.settings.shutdown_grace, semaphore.acquire_many(all_permits))
                .await;
        if drained.is_err() {
            warn!(kind = %kind, "drain grace elapsed, cancelling in-flight jobs");
            in_flight.cancel();
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                semaphore.acquire_many(all_permits),
            )
            .await;
        }
        info!(kind = %kind, "worker runtime stopped");
    }

    /// Poll until a job is available, reporting liveness on every tick.
    async fn wait_for_job(&self) -> Job {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            match self.queue.reserve(self.settings.kind).await {
                Ok(Some(job)) => return job,
                Ok(None) => {}
                Err(error) => {
                    // Broker unreachable is transient: keep polling.
                    error!(kind = %self.settings.kind, %error, "failed to reserve job");
                }
            }
        }
    }
}

async fn run_job<P: JobProcessor>(
    queue: Queue,
    processor: Arc<P>,
    limiter: Arc<TokenBucket>,
    job: Job,
    job_cancel: CancellationToken,
    heartbeat_interval: Duration,
) {
    let context = CorrelationContext::from_correlation_id(job.correlation_id);
    let span = context.span(job.kind.as_str());
    let kind = job.kind;

    async {
        let started = Instant::now();
        info!(job_id = %job.id, attempt = job.attempt, "job starting");

        let (progress_tx, progress_rx) = watch::channel(0u8);
        let heartbeats = tokio::spawn(heartbeat_loop(
            queue.clone(),
            job.id,
            job.lock(),
            progress_rx,
            heartbeat_interval,
            job_cancel.clone(),
        ));

        let result = tokio::select! {
            biased;
            _ = job_cancel.cancelled() => Err(JobError::Cancelled),
            result = processor.process(&job, ProgressHandle::new(progress_tx), job_cancel.clone()) => result,
        };

        heartbeats.abort();
        let elapsed = started.elapsed();
        metrics::histogram!("job_processing_duration_seconds", &[("kind", kind.as_str())])
            .record(elapsed.as_secs_f64());

        match result {
            Ok(mut outcome) => {
                outcome.processing_time_ms = elapsed.as_millis() as u64;
                info!(
                    job_id = %job.id,
                    items_processed = outcome.items_processed,
                    duration_ms = outcome.processing_time_ms,
                    "job completed"
                );
                let job_id = job.id;
                if let Err(error) = queue.complete(job, &outcome).await {
                    // The reservation lapsed under us; the job will re-run,
                    // which upserts are safe against.
                    warn!(job_id = %job_id, %error, "failed to ack completed job");
                }
            }
            Err(JobError::Cancelled) => {
                info!(job_id = %job.id, "job cancelled, releasing without consuming the attempt");
                let job_id = job.id;
                if let Err(error) = queue.release(job).await {
                    warn!(job_id = %job_id, %error, "failed to release cancelled job");
                }
            }
            Err(job_error) => {
                if matches!(job_error, JobError::RateLimited { .. }) {
                    limiter.throttle().await;
                }
                let retry = job_error.is_retryable();
                let preferred_delay = job_error.retry_after();
                let job_id = job.id;
                warn!(job_id = %job_id, error = %job_error, retry, "job failed");
                match queue
                    .fail(job, &job_error.to_string(), None, retry, preferred_delay)
                    .await
                {
                    Ok(disposition) => {
                        info!(job_id = %job_id, ?disposition, "job failure recorded");
                    }
                    Err(error) => {
                        warn!(job_id = %job_id, %error, "failed to record job failure");
                    }
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Refresh the reservation on a schedule, forwarding the processor's
/// latest progress. Losing the lock means the stall sweep reclaimed the
/// job; the processor is cancelled so two workers never run it at once.
async fn heartbeat_loop(
    queue: Queue,
    job_id: uuid::Uuid,
    lock_id: uuid::Uuid,
    progress_rx: watch::Receiver<u8>,
    interval: Duration,
    job_cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The reservation itself stamped the first heartbeat.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = job_cancel.cancelled() => return,
            _ = ticker.tick() => {
                let progress = *progress_rx.borrow();
                match queue.heartbeat(job_id, lock_id, Some(progress)).await {
                    Ok(()) => {}
                    Err(QueueError::InvalidLock { .. }) => {
                        warn!(job_id = %job_id, "reservation lost, cancelling processor");
                        job_cancel.cancel();
                        return;
                    }
                    Err(error) => {
                        warn!(job_id = %job_id, %error, "heartbeat failed, will retry");
                    }
                }
            }
        }
    }
}
