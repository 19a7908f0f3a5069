use image_batch_processor::{
    config::AppConfig,
    db,
    services::{
        dispatcher::Dispatcher,
        events::{self, EventBus},
        job_store::{JobStore, PgJobStore},
        lease::LeaseManager,
        metadata::HttpMetadataFetcher,
        processor::ItemProcessor,
        queue::JobQueue,
        reference_data,
        state_machine::JobRunner,
        status_cache::{RedisStatusCache, StatusWriter},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image processing worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    let settings = config.worker_settings();

    // Metrics listener
    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    // Reference data is loaded once and shared read-only
    let reference = Arc::new(
        reference_data::load(&config.reference_data_path)
            .await
            .expect("Failed to load store reference data"),
    );

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let queue = Arc::new(
        JobQueue::connect(&config.redis_url)
            .await
            .expect("Failed to initialize job queue"),
    );
    let cache = RedisStatusCache::new(&config.redis_url)
        .await
        .expect("Failed to initialize status cache");
    let fetcher =
        HttpMetadataFetcher::new(settings.fetch_timeout).expect("Failed to build HTTP client");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));
    let status = Arc::new(StatusWriter::new(
        Arc::clone(&store),
        Arc::new(cache),
        settings.status_ttl,
    ));
    let processor = Arc::new(ItemProcessor::new(
        Arc::clone(&store),
        Arc::new(fetcher),
        reference,
        settings.processing_delay,
    ));
    let runner = Arc::new(JobRunner::new(
        store,
        status,
        processor,
        settings.stall_threshold,
    ));

    let events = EventBus::new();
    tokio::spawn(events::log_events(events.subscribe()));

    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        LeaseManager::new(queue, settings.heartbeat_interval),
        runner,
        events,
        settings,
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received, finishing in-flight jobs");
        shutdown.cancel();
    });

    tracing::info!("Worker ready, starting job processing loop");
    dispatcher.run(cancel).await;
    tracing::info!("Worker stopped");
}

fn describe_metrics() {
    metrics::describe_counter!("image_jobs_completed_total", "Jobs whose images all succeeded");
    metrics::describe_counter!("image_jobs_failed_total", "Jobs with at least one failed image");
    metrics::describe_counter!(
        "image_jobs_skipped_total",
        "Deliveries skipped because another worker held the job"
    );
    metrics::describe_counter!("image_items_processed_total", "Images processed");
    metrics::describe_counter!("image_items_failed_total", "Images that failed");
    metrics::describe_counter!(
        "lease_renewal_failures_total",
        "Lease renewals that failed even after re-acquisition"
    );
    metrics::describe_histogram!(
        "image_job_processing_seconds",
        "Time to process all images of a job"
    );
}
