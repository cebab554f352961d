use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use health::HealthRegistry;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use attribution_engine::config::Config;
use attribution_engine::dead_letter::LogDeadLetterSink;
use attribution_engine::pipeline::Pipeline;
use attribution_engine::server::{router, serve, setup_metrics_recorder};
use attribution_engine::sink::PrintSink;
use attribution_engine::time::SystemClock;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting attribution engine...");

    let config = Config::init_from_env().context("failed to load configuration")?;
    let pipeline_config = config.to_pipeline_config();
    info!(
        partitions = pipeline_config.partitions,
        models = ?pipeline_config.requested_models,
        journey_window = ?pipeline_config.journey_window,
        out_of_order_tolerance = ?pipeline_config.out_of_order_tolerance,
        max_open_journeys = pipeline_config.max_open_journeys,
        "Configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let recorder_handle =
        setup_metrics_recorder().context("failed to install metrics recorder")?;

    let pipeline = Arc::new(Pipeline::start(
        pipeline_config,
        Arc::new(PrintSink {}),
        Arc::new(LogDeadLetterSink {}),
        Arc::new(SystemClock::default()),
        &liveness,
    ));

    let bind = config.bind();
    let app = router(pipeline.clone(), liveness, Some(recorder_handle));
    let server = tokio::spawn(async move {
        if let Err(e) = serve(app, &bind).await {
            error!("failed to serve operational endpoints on {}: {}", bind, e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("Shutdown signal received");

    let report = pipeline.drain().await?;
    if let Some(reason) = &report.halted {
        warn!("pipeline was halted before shutdown: {}", reason);
    }
    info!(
        force_expired = report.force_expired,
        results_published = report.results_published,
        failed_batches = report.failed_batches,
        "Attribution engine shut down"
    );

    server.abort();
    Ok(())
}
