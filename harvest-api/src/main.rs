//! Operator HTTP surface for the harvesting pipeline: enqueue jobs,
//! pause/resume/clean queues, inspect and replay dead letters.

use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info};

use harvest_common::logging;
use harvest_common::shutdown::install_emergency_exit_hook;
use harvest_queue::{DeadLetterManager, Queue};

mod config;
mod handlers;

use config::Config;
use handlers::ApiState;

async fn listen(app: axum::Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
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
        "starting harvest-api"
    );

    let pool = match config.pool_config().connect().await {
        Ok(pool) => pool,
        Err(error) => {
            error!(%error, "failed to connect to the database");
            std::process::exit(1);
        }
    };

    let state = ApiState::new(
        Queue::from_pool(pool.clone(), "harvest-api"),
        DeadLetterManager::from_pool(pool),
    );
    let app = handlers::add_routes(axum::Router::new(), state)
        .merge(harvest_common::metrics::setup_metrics_router());

    match listen(app, config.bind()).await {
        Ok(()) => {}
        Err(error) => error!(%error, "failed to start harvest-api http server"),
    }
}
