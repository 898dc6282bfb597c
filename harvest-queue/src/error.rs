use uuid::Uuid;

use crate::codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid lock {lock} for job {job}. This usually means the reservation lapsed and the stall sweep reclaimed the job - did the heartbeat stop?")]
    InvalidLock { job: Uuid, lock: Uuid },
    #[error("unknown job id: {0}")]
    UnknownJob(Uuid),
    #[error("unknown dead letter id: {0}")]
    UnknownDeadLetter(Uuid),
}
