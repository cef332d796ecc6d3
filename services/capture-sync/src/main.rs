use anyhow::{Context, Result};
use capture_sync::capture::{
    FsMediaCapture, LatestReadings, NoLocation, NullDiscovery, RecordAssembler,
};
use capture_sync::{
    start_api_server, AppState, Auditor, Config, EventDetector, HmacSigner, HttpTransport,
    IntegrityValidator, ProofOfWork, RecentEvents, SqliteBackend, Stores, SyncQueue, Uploader,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting capture sync service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Open the document store
    let backend = SqliteBackend::connect(&config.store)
        .await
        .context("Failed to open document store")?;

    // Run migrations if enabled
    if config.store.run_migrations {
        backend
            .run_migrations()
            .await
            .context("Failed to run document store migrations")?;
    }

    let stores = Stores::open(Arc::new(backend)).context("Failed to open store namespaces")?;

    // The secret is read once here and only lives inside the signer
    let signer = HmacSigner::new(config.integrity.secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid integrity secret: {}", e))?;
    let validator = IntegrityValidator::new(
        Arc::new(signer),
        ProofOfWork::new(config.integrity.difficulty_prefix.clone()),
    );

    let readings = LatestReadings::new();
    let assembler = Arc::new(RecordAssembler::new(
        stores.clone(),
        validator.clone(),
        Arc::new(readings.clone()),
        Arc::new(NoLocation),
        Arc::new(FsMediaCapture::default()),
        Arc::new(NullDiscovery),
        RecentEvents::new(config.detection.recent_events_capacity),
        config.capture.clone(),
        &config.integrity,
    ));
    let detector = EventDetector::new(
        &config.detection,
        readings,
        stores.clone(),
        assembler.clone(),
    );

    let transport = HttpTransport::new(config.sync.endpoint_url.clone(), config.delivery_timeout())
        .context("Failed to build delivery client")?;
    let uploader = Arc::new(Uploader::new(
        stores.records.clone(),
        Arc::new(transport),
        config.delivery_timeout(),
    ));
    let queue = Arc::new(SyncQueue::new(
        stores.queue.clone(),
        uploader.clone(),
        config.sync.drain_concurrency,
        config.sync.max_queue_attempts,
    ));
    let auditor = Arc::new(Auditor::new(stores.clone(), validator, uploader.locks()));

    // Entries claimed by a previous process that never finished
    queue
        .reset_stale()
        .await
        .context("Failed to reset stale queue entries")?;

    let (readings_tx, readings_rx) = mpsc::channel(config.detection.reading_channel_capacity);

    // Spawn event detector task
    let detector_handle = tokio::spawn(async move {
        detector.run(readings_rx).await;
    });

    // Spawn periodic queue drain task
    let drain_queue = queue.clone();
    let drain_interval = config.drain_interval();
    let drain_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = drain_queue.drain().await {
                error!(error = %e, "Queue drain failed");
            }
        }
    });

    // Create API state
    let api_state = AppState {
        stores,
        assembler,
        uploader,
        queue,
        auditor,
        readings: readings_tx,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!(
        endpoint = %config.sync.endpoint_url,
        drain_interval_secs = config.sync.drain_interval_secs,
        "Capture sync service started successfully"
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down capture sync service");

    // Abort tasks
    api_handle.abort();
    drain_handle.abort();
    detector_handle.abort();

    info!("Capture sync service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
