use std::future::ready;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::api;
use crate::pipeline::Pipeline;

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

pub async fn index() -> &'static str {
    "attribution engine"
}

/// Ingestion routes on top of the operational ones: index, readiness, liveness
/// from the health registry and, when a recorder is installed, Prometheus metrics.
pub fn router(
    pipeline: Arc<Pipeline>,
    liveness: HealthRegistry,
    recorder_handle: Option<PrometheusHandle>,
) -> Router {
    let router: Router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/v1/events", post(api::ingest_event))
        .route("/v1/events/batch", post(api::ingest_batch))
        .with_state(pipeline);

    let router = match recorder_handle {
        Some(handle) => router.route("/metrics", get(move || ready(handle.render()))),
        None => router,
    };
    router.layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
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
