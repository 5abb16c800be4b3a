use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cytoseg_core::job::JobKindTag;
use cytoseg_core::store::JobStore;
use cytoseg_core::work::WorkFunction;
use cytoseg_events::EventHub;
use cytoseg_inference::InferenceClient;
use cytoseg_scheduler::{MemoryJobStore, PoolSpec, Scheduler, SchedulerConfig};

use cytoseg_api::config::ServerConfig;
use cytoseg_api::{routes, state, ws};

use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cytoseg_api=debug,cytoseg_scheduler=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Job store ---
    // Postgres when DATABASE_URL is set, in-memory otherwise.
    let mut pool = None;
    let store: Arc<dyn JobStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pg_pool = cytoseg_db::create_pool(&database_url, 10)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            cytoseg_db::health_check(&pg_pool)
                .await
                .expect("Database health check failed");

            cytoseg_db::run_migrations(&pg_pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            pool = Some(pg_pool.clone());
            Arc::new(cytoseg_db::PgJobStore::new(pg_pool))
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, using the in-memory job store");
            Arc::new(MemoryJobStore::new())
        }
    };

    // --- Event hub ---
    let hub = Arc::new(EventHub::new(config.event_retention));

    // --- Work function clients ---
    // One reqwest client pools connections across all downstream calls.
    let http = reqwest::Client::new();
    let segmentation: Arc<dyn WorkFunction> = Arc::new(InferenceClient::with_client(
        http.clone(),
        config.inference_url.clone(),
    ));
    let export: Arc<dyn WorkFunction> = Arc::new(InferenceClient::for_endpoint(
        http.clone(),
        config.inference_url.clone(),
        "/api/v1/export",
    ));
    let upload: Arc<dyn WorkFunction> = Arc::new(InferenceClient::for_endpoint(
        http,
        config.inference_url.clone(),
        "/api/v1/ingest",
    ));

    // --- Scheduler ---
    let gpu_pool = PoolSpec::new("gpu", config.gpu_pool_capacity)
        .handler(JobKindTag::Segmentation, segmentation)
        .job_timeout(config.job_timeout())
        .retries(config.max_transient_retries, Duration::from_millis(500));
    let io_pool = PoolSpec::new("io", config.io_pool_capacity)
        .handler(JobKindTag::Export, export)
        .handler(JobKindTag::Upload, upload)
        .job_timeout(config.job_timeout())
        .retries(config.max_transient_retries, Duration::from_millis(500));

    let scheduler = Arc::new(Scheduler::new(
        store,
        Arc::clone(&hub),
        SchedulerConfig::new(vec![gpu_pool, io_pool]),
    ));
    scheduler.start();

    // --- CORS ---
    let cors = build_cors_layer(&config);

    // --- WebSocket manager ---
    let ws_manager = Arc::new(ws::WsManager::new());

    // --- Heartbeat ---
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager), config.ws_heartbeat());

    // --- App state ---
    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        hub,
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        pool,
    };

    // --- Request ID header name ---
    let request_id_header = HeaderName::from_static("x-request-id");

    // --- Router ---
    let app = Router::new()
        // Health check at root level (not under /api/v1).
        .merge(routes::health::router())
        // API v1 routes.
        .nest("/api/v1", routes::api_routes())
        // -- Middleware stack (applied bottom-up) --
        // Panic recovery: catch panics and return 500 JSON.
        .layer(CatchPanicLayer::new())
        // Request timeout.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        // Propagate request ID to response.
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        // Structured request/response tracing.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // Set request ID on incoming requests.
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        // CORS.
        .layer(cors)
        // Shared state.
        .with_state(state);

    // --- Start server ---
    let addr = SocketAddr::new(config.host.parse().expect("Invalid HOST address"), config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stop the scheduler first: workers exit, in-flight jobs settle or stay
    // Queued for the next process.
    scheduler.shutdown().await;

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    heartbeat_handle.abort();
    tracing::info!("Heartbeat task stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Build the CORS layer from the configured origins.
fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> =
        config.cors_origins.iter().filter_map(|origin| origin.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static("x-owner-id")])
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server shuts
/// down cleanly whether stopped interactively or by a process manager
/// (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
