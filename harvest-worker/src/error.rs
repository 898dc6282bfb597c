use std::time::Duration;

use harvest_queue::CodecError;

/// Classification of processor failures, driving the retry decision made
/// by the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Worth retrying with backoff: network timeouts, 5xx, broker hiccups.
    #[error("transient: {0}")]
    Transient(String),
    /// External API pushed back explicitly. Retried with backoff, and the
    /// rate limiter is told to slow down for the next window.
    #[error("rate limited: {reason}")]
    RateLimited {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Retrying cannot help; goes straight to the dead-letter queue.
    #[error("permanent: {0}")]
    Permanent(String),
    /// The payload failed schema validation after reservation.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// The worker asked the processor to stop. The attempt is refunded.
    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Transient(_) | JobError::RateLimited { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            JobError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<CodecError> for JobError {
    fn from(error: CodecError) -> Self {
        JobError::InvalidPayload(error.to_string())
    }
}

impl From<sqlx::Error> for JobError {
    fn from(error: sqlx::Error) -> Self {
        JobError::Transient(format!("database error: {}", error))
    }
}

impl From<crate::repository::StoreError> for JobError {
    fn from(error: crate::repository::StoreError) -> Self {
        JobError::Transient(error.to_string())
    }
}
