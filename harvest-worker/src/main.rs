//! Process root for the harvesting workers: builds the pool, queue,
//! processors and observability surface, then supervises an ordered
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use envconfig::Envconfig;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info, warn, Instrument};

use harvest_common::health::{
    ComponentStatus, DependencyCheck, DependencyMonitor, HealthRegistry,
};
use harvest_common::logging;
use harvest_common::shutdown::{install_emergency_exit_hook, ShutdownCoordinator};
use harvest_queue::{
    DeadLetterManager, JobKind, Queue, QueueMonitor, ScrapePayload, SortMethod,
    DEFAULT_LABEL_MODEL,
};
use harvest_worker::catalog::ItunesCatalog;
use harvest_worker::config::Config;
use harvest_worker::label::{LabelProcessor, LabelSettings};
use harvest_worker::llm::OpenAiClient;
use harvest_worker::repository::PgReviewStore;
use harvest_worker::runtime::{JobProcessor, WorkerRuntime};
use harvest_worker::scrape::ScrapeProcessor;
use harvest_worker::stubs::StubProcessor;

#[tokio::main]
async fn main() {
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {}", error);
            std::process::exit(1);
        }
    };
    let log_format = match config.log_format() {
        Ok(format) => format,
        Err(error) => {
            eprintln!("invalid configuration: {}", error);
            std::process::exit(1);
        }
    };

    logging::init(&config.log_level, log_format);
    install_emergency_exit_hook();

    let span = logging::process_span(
        "harvest-worker",
        env!("CARGO_PKG_VERSION"),
        &config.environment,
    );
    let code = async {
        info!(
            database_url = %logging::redact_url_credentials(&config.database_url),
            scraper_mode = %config.scraper_mode,
            labeler_mode = %config.labeler_mode,
            "starting harvest-worker"
        );
        run(config).await
    }
    .instrument(span)
    .await;

    std::process::exit(code);
}

async fn run(config: Config) -> i32 {
    let pool = match config.pool_config().connect().await {
        Ok(pool) => pool,
        Err(error) => {
            error!(%error, "failed to connect to the database");
            return 1;
        }
    };

    let queue = Queue::from_pool(pool.clone(), &config.worker_name);
    let store = Arc::new(PgReviewStore::from_pool(pool.clone()));
    let catalog = Arc::new(ItunesCatalog::new(
        &config.catalog_base_url,
        config.catalog_timeout.0,
    ));

    match config.scraper_mode.as_str() {
        "worker" => {}
        "create-jobs" => return create_scrape_jobs(&config, &queue).await,
        other => {
            error!(mode = %other, "SCRAPER_MODE must be one of worker|create-jobs");
            return 1;
        }
    }

    let labeling = match config.labeler_mode.as_str() {
        "disabled" => None,
        mode @ ("worker" | "process-unlabeled") => {
            let Some(api_key) = config.openai_api_key.as_deref() else {
                error!("OPENAI_API_KEY is required when labeling is enabled");
                return 1;
            };
            let model_client = Arc::new(OpenAiClient::new(
                &config.openai_api_base,
                api_key,
                config.llm_timeout.0,
            ));
            let processor = Arc::new(LabelProcessor::new(
                store.clone(),
                model_client,
                LabelSettings {
                    sleep_between_batches: config.label_sleep.0,
                },
            ));
            if mode == "process-unlabeled" {
                return process_unlabeled_once(&config, processor.as_ref()).await;
            }
            Some(processor)
        }
        other => {
            error!(mode = %other, "LABELER_MODE must be one of worker|process-unlabeled|disabled");
            return 1;
        }
    };

    run_workers(config, pool, queue, store, catalog, labeling).await
}

/// Enqueue one scrape job per configured app id, then exit.
async fn create_scrape_jobs(config: &Config, queue: &Queue) -> i32 {
    let app_ids = config.app_id_list();
    if app_ids.is_empty() {
        error!("APP_IDS is required in create-jobs mode");
        return 1;
    }
    let countries = config.country_list();

    for app_id in app_ids {
        let payload = ScrapePayload {
            app_id: app_id.clone(),
            countries: countries.clone(),
            pages: 5,
            sort_methods: vec![SortMethod::Recent, SortMethod::Helpful],
            throttle_ms: 500,
            correlation_id: None,
            priority: 5,
            max_attempts: 3,
            delay_ms: 0,
        };
        match payload.into_job() {
            Ok(job) => match queue.enqueue(job).await {
                Ok(job_id) => info!(app_id = %app_id, job_id = %job_id, "scrape job enqueued"),
                Err(error) => {
                    error!(app_id = %app_id, %error, "failed to enqueue scrape job");
                    return 1;
                }
            },
            Err(error) => {
                error!(app_id = %app_id, %error, "invalid scrape payload");
                return 1;
            }
        }
    }
    0
}

/// One catch-up labeling pass over reviews with no label, then exit.
async fn process_unlabeled_once(config: &Config, processor: &LabelProcessor) -> i32 {
    match processor
        .process_unlabeled(config.process_unlabeled_limit, DEFAULT_LABEL_MODEL, 20)
        .await
    {
        Ok(outcome) => {
            info!(
                items_processed = outcome.items_processed,
                message = outcome.message.as_deref().unwrap_or(""),
                "catch-up labeling finished"
            );
            0
        }
        Err(error) => {
            error!(%error, "catch-up labeling failed");
            1
        }
    }
}

async fn run_workers(
    config: Config,
    pool: PgPool,
    queue: Queue,
    store: Arc<PgReviewStore>,
    catalog: Arc<ItunesCatalog>,
    labeling: Option<Arc<LabelProcessor>>,
) -> i32 {
    let liveness = HealthRegistry::new("liveness");
    let mut readiness = DependencyMonitor::new(Duration::from_secs(5));
    readiness.register(Arc::new(DatabaseCheck { pool: pool.clone() }));
    readiness.register(Arc::new(QueueCheck { pool: pool.clone() }));
    let readiness = Arc::new(readiness);

    let mut coordinator =
        ShutdownCoordinator::new(Duration::from_secs(config.shutdown_timeout_secs));
    let shutdown = coordinator.token();

    // Worker runtimes, one per consumed kind.
    let mut worker_handles = Vec::new();
    {
        let processor = Arc::new(ScrapeProcessor::new(store.clone(), catalog));
        worker_handles.push(
            spawn_runtime(
                queue.clone(),
                processor,
                config.scrape_settings(),
                &liveness,
                &shutdown,
            )
            .await,
        );
    }
    if let Some(processor) = labeling {
        worker_handles.push(
            spawn_runtime(
                queue.clone(),
                processor,
                config.label_settings(),
                &liveness,
                &shutdown,
            )
            .await,
        );
    }
    for kind in [JobKind::ProcessResults, JobKind::Cleanup, JobKind::Export] {
        worker_handles.push(
            spawn_runtime(
                queue.clone(),
                Arc::new(StubProcessor::new(kind)),
                config.stub_settings(kind),
                &liveness,
                &shutdown,
            )
            .await,
        );
    }

    // Periodic queue-depth gauges.
    let monitor = QueueMonitor::new(queue.clone(), DeadLetterManager::from_pool(pool.clone()));
    let monitor_interval = Duration::from_secs(config.monitor_interval_secs);
    let monitor_token = shutdown.clone();
    let monitor_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(monitor_interval);
        loop {
            tokio::select! {
                _ = monitor_token.cancelled() => break,
                _ = interval.tick() => {
                    match monitor.snapshot().await {
                        Ok(snapshot) => monitor.publish(&snapshot),
                        Err(error) => warn!(%error, "queue monitor snapshot failed"),
                    }
                }
            }
        }
    });

    // Health and metrics surface.
    let app_state = AppState {
        liveness: liveness.clone(),
        readiness: readiness.clone(),
        worker_name: config.worker_name.clone(),
    };
    let router = Router::new()
        .route("/health", get(health))
        .route("/_liveness", get(live))
        .route("/_readiness", get(ready))
        .with_state(app_state)
        .merge(harvest_common::metrics::setup_metrics_router());

    let bind = config.bind();
    let server_token = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(error) => {
                error!(%error, bind = %bind, "failed to bind health/metrics listener");
                return;
            }
        };
        info!(bind = %bind, "health/metrics listener started");
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_token.cancelled().await });
        if let Err(error) = serve.await {
            error!(%error, "health/metrics server failed");
        }
    });

    // Ordered teardown: health loop, workers, http, pool.
    coordinator.on_shutdown("stop-monitor", 10, move || async move {
        let _ = monitor_handle.await;
    });
    coordinator.on_shutdown("drain-workers", 20, move || async move {
        for handle in worker_handles {
            let _ = handle.await;
        }
    });
    coordinator.on_shutdown("stop-http", 30, move || async move {
        let _ = server_handle.await;
    });
    let pool_to_close = pool.clone();
    coordinator.on_shutdown("close-pool", 40, move || async move {
        pool_to_close.close().await;
    });

    info!("harvest-worker running");
    let clean = coordinator.run().await;
    if clean {
        0
    } else {
        1
    }
}

async fn spawn_runtime<P: JobProcessor>(
    queue: Queue,
    processor: Arc<P>,
    settings: harvest_worker::runtime::WorkerSettings,
    liveness: &HealthRegistry,
    shutdown: &tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let handle = liveness
        .register(
            format!("{}-worker", settings.kind),
            chrono::Duration::seconds(60),
        )
        .await;
    let runtime = WorkerRuntime::new(queue, processor, settings, handle, shutdown.clone());
    tokio::spawn(async move { runtime.run().await })
}

#[derive(Clone)]
struct AppState {
    liveness: HealthRegistry,
    readiness: Arc<DependencyMonitor>,
    worker_name: String,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let aggregate = state.readiness.check_all().await;
    let liveness = state.liveness.get_status();

    let worker_health: serde_json::Map<String, serde_json::Value> = liveness
        .components
        .iter()
        .map(|(name, status)| (name.clone(), json!(component_status_name(status))))
        .collect();

    Json(json!({
        "status": aggregate.status,
        "timestamp": Utc::now(),
        "service": "harvest-worker",
        "worker": state.worker_name,
        "worker_health": worker_health,
        "connections": aggregate.dependencies,
    }))
}

fn component_status_name(status: &ComponentStatus) -> &'static str {
    match status {
        ComponentStatus::Starting => "starting",
        ComponentStatus::HealthyUntil(_) => "healthy",
        ComponentStatus::Unhealthy => "unhealthy",
        ComponentStatus::Stalled => "stalled",
    }
}

async fn live(State(state): State<AppState>) -> impl IntoResponse {
    state.liveness.get_status()
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    state.readiness.check_all().await
}

struct DatabaseCheck {
    pool: PgPool,
}

#[async_trait::async_trait]
impl DependencyCheck for DatabaseCheck {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Proves the queue schema is reachable, not just the server.
struct QueueCheck {
    pool: PgPool,
}

#[async_trait::async_trait]
impl DependencyCheck for QueueCheck {
    fn name(&self) -> &str {
        "queue"
    }

    async fn check(&self) -> Result<(), String> {
        sqlx::query("SELECT COUNT(*) FROM queue_control")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
