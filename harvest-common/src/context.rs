use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation bundle threaded through every job, log record and outbound
/// call. A child task inherits the parent's correlation and trace ids and
/// gets a fresh span via [`CorrelationContext::span`]; tracing mints the
/// span id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelationContext {
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl CorrelationContext {
    /// Mint a fresh context for a new logical request.
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            correlation_id: id,
            parent_id: None,
            trace_id: id,
            started_at: Utc::now(),
        }
    }

    /// Adopt an existing correlation id (e.g. from a job record) as the
    /// root of a new trace.
    pub fn from_correlation_id(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            parent_id: None,
            trace_id: correlation_id,
            started_at: Utc::now(),
        }
    }

    /// Derive a child context: same trace, parent recorded, fresh start.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            parent_id: Some(self.correlation_id),
            trace_id: self.trace_id,
            started_at: Utc::now(),
        }
    }

    /// A tracing span carrying the correlation fields. Every log record
    /// emitted inside inherits them.
    pub fn span(&self, operation: &'static str) -> tracing::Span {
        tracing::info_span!(
            "task",
            operation,
            correlation_id = %self.correlation_id,
            trace_id = %self.trace_id,
        )
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_keeps_trace_and_records_parent() {
        let parent = CorrelationContext::new();
        let child = parent.child();

        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_id, Some(parent.correlation_id));
        assert_ne!(child.correlation_id, parent.correlation_id);
    }

    #[test]
    fn adopted_correlation_id_roots_the_trace() {
        let id = Uuid::new_v4();
        let ctx = CorrelationContext::from_correlation_id(id);
        assert_eq!(ctx.correlation_id, id);
        assert_eq!(ctx.trace_id, id);
        assert_eq!(ctx.parent_id, None);
    }
}
