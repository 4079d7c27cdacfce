use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use sacloud_machine_controller::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        jobs::JobRegistry, lifecycle::MachineController, metadata::MkisofsPackager,
        orchestrator, sacloud::SakuraCloudClient, JobContext,
    },
    store::MachineStore,
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

    tracing::info!("Initializing sacloud-machine-controller");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("machine_jobs_started_total", "Background jobs started");
    metrics::describe_counter!("machine_jobs_completed_total", "Background jobs that finished");
    metrics::describe_counter!("machine_jobs_failed_total", "Background jobs that failed");
    metrics::describe_histogram!("machine_job_seconds", "Wall time of a background job");
    metrics::describe_histogram!("machine_reconcile_seconds", "Time spent in one reconcile pass");
    metrics::describe_gauge!("machine_records", "Machine records in the store");
    metrics::describe_gauge!("machine_jobs_tracked", "Entries in the job registry");
    metrics::describe_gauge!("cluster_api_endpoints", "Clusters with a published API endpoint");

    tracing::info!(
        api_root = %config.sakuracloud_api_root_url,
        zone = %config.default_zone,
        "Initializing SakuraCloud client"
    );
    let backend = SakuraCloudClient::new(
        &config.sakuracloud_api_root_url,
        &config.sakuracloud_access_token,
        &config.sakuracloud_access_token_secret,
    )
    .expect("Failed to initialize SakuraCloud client")
    .with_disk_wait(
        config.wait_settings().timeout,
        config.wait_settings().poll_interval,
    );

    let registry = Arc::new(JobRegistry::new());
    let jobs = JobContext {
        backend: Arc::new(backend),
        packager: Arc::new(MkisofsPackager::new(&config.mkisofs_path)),
        registry: registry.clone(),
        wait: config.wait_settings(),
    };

    let controller = MachineController::new(jobs, config.controller_settings());
    let state = AppState::new(
        controller,
        registry,
        MachineStore::new(),
        config.reconcile_concurrency,
    );

    let shutdown = CancellationToken::new();
    let reconciler = tokio::spawn(orchestrator::run(
        state.clone(),
        config.requeue_interval(),
        shutdown.clone(),
    ));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/namespaces/{namespace}/machines/{name}",
            get(routes::machines::get_machine)
                .put(routes::machines::apply_machine)
                .delete(routes::machines::delete_machine),
        )
        .route(
            "/api/v1/namespaces/{namespace}/clusters/{cluster}/endpoint",
            get(routes::clusters::get_endpoint),
        )
        .route("/api/v1/jobs/{*job_id}", get(routes::jobs::get_job))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    if let Err(e) = reconciler.await {
        tracing::error!(error = %e, "Reconcile loop panicked");
    }
}
