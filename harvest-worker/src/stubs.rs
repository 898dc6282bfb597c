//! No-op processors for the job kinds whose pipelines are not built yet
//! (results aggregation, retention cleanup, exports). They ack jobs so the
//! queues drain instead of accumulating forever.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use harvest_queue::{Job, JobKind, JobOutcome};

use crate::error::JobError;
use crate::runtime::{JobProcessor, ProgressHandle};

pub struct StubProcessor {
    kind: JobKind,
}

impl StubProcessor {
    pub fn new(kind: JobKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl JobProcessor for StubProcessor {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn process(
        &self,
        job: &Job,
        progress: ProgressHandle,
        _cancel: CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        info!(job_id = %job.id, kind = %self.kind, "processor not implemented, acking as no-op");
        progress.report(100);
        Ok(JobOutcome::success(json!({}), 0).with_message("processor not implemented"))
    }
}
