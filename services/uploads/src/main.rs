use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uploads_service::{
    start_api_server, AppState, Config, FileAccessService, InProcEventBus, IngestService, Janitor,
    MetadataRepository, MetadataStore, QueryService, Readiness, S3BlobStore, StorageBridge,
    UploadEvent, UploadRateLimiter,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting uploads service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let metadata_store = MetadataStore::new(&config.database)
        .await
        .context("Failed to initialize metadata store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    let metadata: Arc<dyn MetadataRepository> = Arc::new(metadata_store);

    // An unreachable bucket is not fatal: the bridge rejects storage calls
    // and /ready reports it.
    let storage = Arc::new(StorageBridge::new(Arc::new(
        S3BlobStore::new(&config.s3).await,
    )));
    if storage.initialize().await != Readiness::Ready {
        warn!(bucket = %config.s3.bucket, "Starting without object storage");
    }

    let events = Arc::new(InProcEventBus::<UploadEvent>::new(
        config.events.channel_capacity,
    ));

    let api_state = AppState {
        ingest: IngestService::new(storage.clone(), metadata.clone(), events.clone()),
        queries: Arc::new(QueryService::new(
            metadata.clone(),
            config.pagination.clone(),
        )),
        files: Arc::new(FileAccessService::new(
            storage.clone(),
            metadata.clone(),
            config.presigned_url_expiry(),
        )),
        events: events.clone(),
        storage: storage.clone(),
        metadata: metadata.clone(),
        upload_limiter: Arc::new(UploadRateLimiter::new(
            config.api.upload_rate_limit,
            config.api.upload_rate_window(),
        )),
        max_upload_bytes: config.api.max_upload_bytes,
    };

    let shutdown = CancellationToken::new();

    // Spawn janitor task
    let janitor_handle = if config.janitor.enabled {
        let janitor = Arc::new(Janitor::new(
            storage.clone(),
            metadata.clone(),
            config.janitor.grace_period(),
        ));
        Some(janitor.start(config.janitor.interval(), shutdown.clone()))
    } else {
        info!("Janitor disabled");
        None
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    shutdown_signal().await;

    info!("Shutting down uploads service");

    // Closing the bus ends open event streams so the server can drain.
    events.close();
    shutdown.cancel();

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }
    if let Some(handle) = janitor_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Janitor task failed");
        }
    }

    info!("Uploads service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
