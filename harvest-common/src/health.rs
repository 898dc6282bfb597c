use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Liveness reporting for the long-running loops of a worker process.
///
/// The process contains several asynchronous loops (reservation loops,
/// heartbeat tasks, maintenance loops), and it can only be trusted with
/// work if all of them are still making progress. Each loop registers a
/// component and must report healthy more often than its deadline:
///   - if any component reported unhealthy, the process is unhealthy,
///   - if a component missed its deadline, it is considered stalled and
///     the check fails,
///   - otherwise the process is healthy.
///
/// Liveness and readiness are deliberately kept in separate registries;
/// merging the two k8s concepts into one state invites probe bugs.
#[derive(Debug, Default)]
pub struct LivenessStatus {
    /// True when every registered component recently reported healthy.
    pub healthy: bool,
    /// Last known status of each component, for debugging.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Healthy until the deadline, after which it counts as stalled.
    HealthyUntil(DateTime<Utc>),
    /// Explicitly reported unhealthy.
    Unhealthy,
    /// Deadline elapsed without a report.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

/// Handle given to a component so it can report its own liveness.
pub struct HealthHandle {
    component: String,
    deadline: chrono::Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy for another `deadline` window. Must be called more
    /// frequently than the deadline the component registered with.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err);
        }
    }
}

/// Registry aggregating the liveness of all registered components.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Poisoned lock: the probes will fail and the process restart.
                    warn!("poisoned HealthRegistry lock");
                }
            }
        });

        registry
    }

    /// Register a component. The returned handle should be moved into the
    /// component's loop so it can report on a schedule.
    pub async fn register(&self, component: String, deadline: chrono::Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Compute the overall process liveness. Usable as an axum handler.
    pub fn get_status(&self) -> LivenessStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        // Unhealthy until at least one component has registered.
        let mut result = LivenessStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        let now = Utc::now();

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                other => {
                    result.healthy = false;
                    result.components.insert(name.clone(), other.clone());
                }
            }
        }

        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

/// Status of one external dependency, as seen by a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time health record for one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: DependencyStatus,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A probe against one external dependency (database, broker, ...).
#[async_trait::async_trait]
pub trait DependencyCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Critical dependencies force the aggregate to unhealthy when down;
    /// non-critical ones only degrade it.
    fn critical(&self) -> bool {
        true
    }

    async fn check(&self) -> Result<(), String>;
}

/// Aggregate report across all registered dependencies.
#[derive(Debug, Serialize)]
pub struct AggregateHealth {
    pub status: DependencyStatus,
    pub checked_at: DateTime<Utc>,
    pub dependencies: Vec<DependencyHealth>,
}

impl IntoResponse for AggregateHealth {
    fn into_response(self) -> Response {
        let code = match self.status {
            DependencyStatus::Healthy | DependencyStatus::Degraded => StatusCode::OK,
            DependencyStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };
        (code, Json(self)).into_response()
    }
}

/// Runs dependency probes with a per-check timeout and folds the results
/// into a single status.
pub struct DependencyMonitor {
    checks: Vec<Arc<dyn DependencyCheck>>,
    check_timeout: Duration,
}

impl DependencyMonitor {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            check_timeout,
        }
    }

    pub fn register(&mut self, check: Arc<dyn DependencyCheck>) {
        self.checks.push(check);
    }

    pub async fn check_all(&self) -> AggregateHealth {
        let mut dependencies = Vec::with_capacity(self.checks.len());
        let mut status = DependencyStatus::Healthy;

        for check in &self.checks {
            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(self.check_timeout, check.check()).await;
            let response_time_ms = started.elapsed().as_millis() as u64;

            let (dep_status, error) = match outcome {
                Ok(Ok(())) => (DependencyStatus::Healthy, None),
                Ok(Err(e)) => (DependencyStatus::Unhealthy, Some(e)),
                Err(_) => (
                    DependencyStatus::Unhealthy,
                    Some(format!(
                        "health check timed out after {:?}",
                        self.check_timeout
                    )),
                ),
            };

            match (dep_status, check.critical()) {
                (DependencyStatus::Unhealthy, true) => status = DependencyStatus::Unhealthy,
                (DependencyStatus::Unhealthy, false) | (DependencyStatus::Degraded, _) => {
                    if status == DependencyStatus::Healthy {
                        status = DependencyStatus::Degraded;
                    }
                }
                _ => {}
            }

            dependencies.push(DependencyHealth {
                name: check.name().to_owned(),
                status: dep_status,
                response_time_ms,
                error,
            });
        }

        AggregateHealth {
            status,
            checked_at: Utc::now(),
            dependencies,
        }
    }
}
