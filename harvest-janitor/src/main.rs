//! Queue maintenance daemon: recovers stalled reservations, quarantines
//! poison pills, prunes finished-job rings, expires old dead letters and
//! publishes queue-depth gauges.

use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info, warn};

use harvest_common::logging;
use harvest_common::shutdown::{install_emergency_exit_hook, ShutdownCoordinator};
use harvest_queue::{DeadLetterManager, Queue, QueueJanitor, QueueMonitor};

mod config;
mod handlers;

use config::Config;
use handlers::AppContext;

async fn listen(app: axum::Router, bind: String, shutdown: tokio_util::sync::CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn cleanup_loop(
    context: Arc<AppContext>,
    interval_secs: u64,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(error) = context.janitor.run_once().await {
                    error!(%error, "janitor pass failed");
                }
                match context.monitor.snapshot().await {
                    Ok(snapshot) => context.monitor.publish(&snapshot),
                    Err(error) => warn!(%error, "queue monitor snapshot failed"),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {}", error);
            std::process::exit(1);
        }
    };
    let log_format = match config.log_format.parse::<logging::LogFormat>() {
        Ok(format) => format,
        Err(error) => {
            eprintln!("invalid configuration: {}", error);
            std::process::exit(1);
        }
    };

    logging::init(&config.log_level, log_format);
    install_emergency_exit_hook();
    info!(
        database_url = %logging::redact_url_credentials(&config.database_url),
        environment = %config.environment,
        "starting harvest-janitor"
    );

    let pool = match config.pool_config().connect().await {
        Ok(pool) => pool,
        Err(error) => {
            error!(%error, "failed to connect to the database");
            std::process::exit(1);
        }
    };

    let janitor = QueueJanitor::from_pool(pool.clone(), config.janitor_settings());
    if config.run_migrations {
        if let Err(error) = janitor.run_migrations().await {
            error!(%error, "failed to run migrations");
            std::process::exit(1);
        }
        info!("migrations applied");
    }

    let monitor = QueueMonitor::new(
        Queue::from_pool(pool.clone(), "harvest-janitor"),
        DeadLetterManager::from_pool(pool.clone()),
    );
    let context = Arc::new(AppContext { janitor, monitor });

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
    let shutdown = coordinator.token();

    let loop_handle = tokio::spawn(cleanup_loop(
        context.clone(),
        config.cleanup_interval_secs,
        shutdown.clone(),
    ));

    let app = handlers::app(context);
    let bind = config.bind();
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(error) = listen(app, bind, server_shutdown).await {
            error!(%error, "janitor http server failed");
        }
    });

    coordinator.on_shutdown("stop-cleanup-loop", 10, move || async move {
        let _ = loop_handle.await;
    });
    coordinator.on_shutdown("stop-http", 20, move || async move {
        let _ = server_handle.await;
    });
    let pool_to_close = pool.clone();
    coordinator.on_shutdown("close-pool", 30, move || async move {
        pool_to_close.close().await;
    });

    let clean = coordinator.run().await;
    std::process::exit(if clean { 0 } else { 1 });
}
