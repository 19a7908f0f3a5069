use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use image_batch_processor::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes::{self, metrics::MetricsState},
    services::{
        job_store::{JobStore, PgJobStore},
        queue::{JobBroker, JobQueue},
        status_cache::{RedisStatusCache, StatusWriter},
    },
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing image-batch-processor API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("image_jobs_submitted_total", "Total jobs submitted");
    metrics::describe_gauge!(
        "image_queue_depth",
        "Jobs waiting in the queue, including delayed retries"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis job queue and status cache
    tracing::info!("Connecting to Redis");
    let queue: Arc<dyn JobBroker> = Arc::new(
        JobQueue::connect(&config.redis_url)
            .await
            .expect("Failed to initialize job queue"),
    );
    let cache = RedisStatusCache::new(&config.redis_url)
        .await
        .expect("Failed to initialize status cache");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));
    let status = StatusWriter::new(Arc::clone(&store), Arc::new(cache), config.status_ttl());

    // Create shared application state
    let state = AppState::new(store, status, Arc::clone(&queue));
    let metrics_state = MetricsState {
        handle: prometheus_handle,
        queue,
    };

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/submit", post(routes::jobs::submit_job))
        .route("/api/status", get(routes::jobs::get_job_status))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    tracing::info!("Starting image-batch-processor on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
