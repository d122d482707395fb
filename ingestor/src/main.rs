use axum::{routing::get, Router};
use ingestor::cache::RetainedCache;
use ingestor::config::{Config, StoreBackend};
use ingestor::ingest::{self, Ingestor};
use ingestor::metrics;
use ingestor::mqtt::{LiveTransport, NullTransport, Transport};
use ingestor::normalize::ReadingDefaults;
use ingestor::reconcile::Reconciler;
use ingestor::recovery::RecoveryProcessor;
use ingestor::rest::{self, AppState};
use ingestor::store::{MemoryStore, PgStore, Store};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting sensor ingestor");
    info!("HTTP server: {}", config.http_addr);

    // Initialize metrics
    metrics::init_metrics();

    // Open the durable store
    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Postgres => {
            info!(
                "Database: {}",
                config.database_url.split('@').last().unwrap_or("***")
            );
            match PgStore::connect(&config.database_url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            }
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; data will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let cache = Arc::new(RetainedCache::new());
    let defaults = ReadingDefaults {
        device_id: config.default_device_id.clone(),
        location: config.default_location.clone(),
    };
    let ingestor = Arc::new(Ingestor::new(store.clone(), cache.clone(), defaults));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        cache.clone(),
        config.canonical_topic.clone(),
    ));
    let recovery = Arc::new(RecoveryProcessor::new(
        store.clone(),
        cache.clone(),
        ingestor.clone(),
        config.recovery_batch_size,
    ));

    // Rebuild retained state and drain whatever a previous run left behind
    match recovery.recover().await {
        Ok(report) => info!(
            "Startup recovery: {} retained applied, {} entries processed, {} readings created",
            report.retained_applied, report.entries_processed, report.readings_created
        ),
        Err(e) => warn!("Startup recovery failed, sweep will retry: {}", e),
    }

    // Create bounded channel for inbound messages
    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    // Spawn the transport task
    let transport: Arc<dyn Transport> = if config.mqtt.enabled {
        info!("MQTT broker: {}:{}", config.mqtt.broker, config.mqtt.port);
        Arc::new(LiveTransport::new(config.mqtt.clone()))
    } else {
        Arc::new(NullTransport)
    };
    let transport_handle = tokio::spawn(async move {
        if let Err(e) = transport.run(tx).await {
            error!("Transport task failed: {}", e);
        }
    });

    // Spawn the ingestion worker
    let worker_ingestor = ingestor.clone();
    let worker_handle = tokio::spawn(async move {
        ingest::run_worker(rx, worker_ingestor).await;
    });

    // Spawn the periodic recovery sweep
    let sweep = recovery.clone();
    let sweep_interval = config.recovery_interval_secs;
    let sweep_handle = tokio::spawn(async move {
        sweep.run_periodic(sweep_interval).await;
    });

    // Build HTTP app with REST API and metrics endpoint
    let state = AppState {
        ingestor,
        reconciler,
        recovery,
        cache,
        store,
        canonical_topic: config.canonical_topic.clone(),
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = transport_handle => {
            error!("Transport task terminated");
        }
        _ = worker_handle => {
            error!("Ingestion worker terminated");
        }
        _ = sweep_handle => {
            error!("Recovery sweep terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
