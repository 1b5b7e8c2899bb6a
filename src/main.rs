use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use stock_meta::app_state::AppState;
use stock_meta::config::AppConfig;
use stock_meta::routes;
use stock_meta::services::{
    batch_tracker::BatchTracker,
    inference::VisionClient,
    orchestrator::{ImageProcessor, ProcessorSettings},
    retry::RetryOptions,
    session::SessionStore,
    stager::{StagerConfig, TempAssetStager},
    uploads::UploadStore,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing stock-meta server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("images_processed_total", "Images processed, by outcome");
    metrics::describe_histogram!("image_processing_seconds", "Time to process one image");
    metrics::describe_counter!("inference_retries_total", "Vision model calls retried after a failure");
    metrics::describe_counter!("temp_assets_created_total", "Temporary image assets staged");
    metrics::describe_counter!("temp_assets_swept_total", "Stale temporary assets removed by the sweeper");
    metrics::describe_gauge!("temp_assets_scheduled", "Temporary assets awaiting scheduled deletion");
    metrics::describe_counter!("batches_created_total", "Batches created");
    metrics::describe_gauge!("active_batches", "Batches currently held in memory");

    tracing::info!(dir = %config.temp_dir.display(), "Initializing temporary asset stager");
    let stager = TempAssetStager::new(StagerConfig {
        dir: config.temp_dir.clone(),
        base_url: config.public_base_url.clone(),
        lifetime: config.temp_url_lifetime(),
        max_age: config.temp_max_age(),
    })
    .await
    .expect("Failed to initialize temp asset directory");
    let stager = Arc::new(stager);

    tracing::info!(model = %config.ai_model, "Initializing vision model client");
    let generator = VisionClient::new(&config.ai_api_url, &config.ai_api_token, &config.ai_model)
        .expect("Failed to initialize vision model client");

    let settings = ProcessorSettings {
        concurrency: config.batch_concurrency,
        timeout: config.image_timeout(),
        continue_on_error: true,
        retry: RetryOptions::default().with_max_attempts(config.retry_attempts),
    };
    let processor = ImageProcessor::new(stager.clone(), Arc::new(generator), settings);

    let uploads = UploadStore::new(config.upload_dir.clone(), config.max_file_bytes)
        .await
        .expect("Failed to initialize upload directory");
    let sessions = SessionStore::new(config.session_ttl(), config.session_image_quota);
    let tracker = BatchTracker::new(config.batch_ttl());

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, sessions, uploads, stager, tracker, processor);
    let _sweepers = state.spawn_sweepers();

    let app = routes::build_router(state, Some(prometheus_handle));

    tracing::info!("Starting stock-meta on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
