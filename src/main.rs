use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use placement_compositor::app_state::AppState;
use placement_compositor::build_router;
use placement_compositor::config::{AppConfig, StorageBackend};
use placement_compositor::services::{
    job_manager::JobManager,
    media::FfmpegCodec,
    pipeline::{Pipeline, PipelineDeps},
    retry::RetryConfig,
    storage::{LocalStore, MediaStore, R2Client},
    stylist::{HttpStyleClient, LocalStyler, StyleCapability},
    vision::{HeuristicConfig, HeuristicDetector, VisionClient, ZoneDetector},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().context("Failed to load configuration from environment")?;
    let policy = config.policy().context("Failed to resolve scoring policy")?;

    tracing::info!("Initializing placement compositor");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus metrics recorder")?;
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "compositor_jobs_submitted_total",
        "Total compositing jobs accepted"
    );
    metrics::describe_counter!(
        "compositor_jobs_completed_total",
        "Total compositing jobs completed"
    );
    metrics::describe_counter!(
        "compositor_jobs_failed_total",
        "Total compositing jobs that failed"
    );
    metrics::describe_counter!(
        "compositor_jobs_cancelled_total",
        "Total compositing jobs cancelled"
    );
    metrics::describe_counter!(
        "compositor_jobs_degraded_total",
        "Completed jobs that took a fallback path"
    );
    metrics::describe_histogram!(
        "compositor_stage_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time of each pipeline stage"
    );
    metrics::describe_gauge!(
        "compositor_queue_depth",
        "Current number of jobs waiting for a worker"
    );

    let storage: Arc<dyn MediaStore> = match config.storage_backend {
        StorageBackend::R2 => {
            tracing::info!("Initializing R2 storage client");
            let (Some(bucket), Some(endpoint), Some(access_key), Some(secret_key)) = (
                config.r2_bucket.as_deref(),
                config.r2_endpoint.as_deref(),
                config.r2_access_key.as_deref(),
                config.r2_secret_key.as_deref(),
            ) else {
                anyhow::bail!("STORAGE_BACKEND=r2 requires R2_BUCKET, R2_ENDPOINT, R2_ACCESS_KEY and R2_SECRET_KEY");
            };
            Arc::new(
                R2Client::new(bucket, endpoint, access_key, secret_key)
                    .context("Failed to initialize R2 client")?,
            )
        }
        StorageBackend::Local => {
            tracing::info!(root = %config.media_root.display(), "Using local media store");
            Arc::new(
                LocalStore::new(&config.media_root)
                    .await
                    .context("Failed to initialize local media store")?,
            )
        }
    };

    let detector: Arc<dyn ZoneDetector> = match &config.vision_service_url {
        Some(url) => {
            tracing::info!(url = %url, "Using remote vision service");
            Arc::new(VisionClient::new(url, config.vision_api_token.clone()))
        }
        None => {
            tracing::info!("No vision service configured, using local heuristics");
            Arc::new(HeuristicDetector::new(HeuristicConfig::default()))
        }
    };

    let styler: Arc<dyn StyleCapability> = match &config.style_service_url {
        Some(url) => {
            tracing::info!(url = %url, "Using remote style service");
            Arc::new(HttpStyleClient::new(url, config.style_api_token.clone()))
        }
        None => Arc::new(LocalStyler),
    };

    let pipeline = Pipeline::new(PipelineDeps {
        store: storage,
        codec: Arc::new(FfmpegCodec::new(&config.ffmpeg_path, &config.ffprobe_path)),
        detector,
        styler: Some(styler),
        policy,
        retry: RetryConfig::from_app_config(&config),
        stage_timeout: config.stage_timeout(),
        capability_timeout: config.capability_timeout(),
    });
    let jobs = JobManager::start_with_retention(
        pipeline,
        config.worker_count,
        config.queue_capacity,
        config.retention(),
    );

    let state = AppState::new(jobs.clone());
    let app = build_router(state, prometheus_handle, config.max_upload_bytes());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Draining in-flight jobs");
    jobs.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
