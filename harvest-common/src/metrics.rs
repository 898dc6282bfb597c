use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided address and serve a `Router` on it.
/// Intended for routers built by `setup_metrics_router`, usually with the
/// caller's health routes merged in.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router exposing the Prometheus scrape endpoint.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_requests))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware recording request counts and latency for every HTTP route.
pub async fn track_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Run `f`, log its duration at debug level and record it under the
/// `performance_duration_seconds` histogram labelled with `operation`.
pub async fn timed<F, T>(operation: &'static str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    tracing::debug!(operation, "operation starting");
    let result = f.await;
    let elapsed = start.elapsed();
    tracing::debug!(operation, duration_ms = elapsed.as_millis() as u64, "operation finished");
    metrics::histogram!("performance_duration_seconds", &[("operation", operation)])
        .record(elapsed.as_secs_f64());
    result
}
