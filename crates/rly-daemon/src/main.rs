//! Relay service daemon
//!
//! Wires the PostgreSQL durable store, the NATS transport, and the two
//! workers into one long-running process:
//! - with no configured destinations it runs a publisher-only node that
//!   drains the shared outbox for its service name
//! - with destinations it also consumes deliveries into the durable inbox
//!
//! Handlers and envelope types are registered in code; a bare daemon runs
//! with empty registries and simply relays outbox traffic.

mod config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info};

use config::DaemonConfig;
use rly_adapters::{NatsConfig, NatsTransport, PostgresWorkStore, StoreConfig};
use rly_runtime::{
    describe_instance, install_global_registry, CoordinatorStrategy, HandlerRegistry,
    InboxConsumerWorker, InboxWorkerConfig, OutboxPublisherWorker, OutboxWorkerConfig,
    ScopeFactory, SerializerRegistry,
};

/// Daemon state shared with the health endpoints
struct DaemonState {
    config: DaemonConfig,
    instance_id: String,
    running: AtomicBool,
}

impl DaemonState {
    fn is_ready(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = DaemonConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(
        service = %config.service_name,
        destinations = ?config.destinations,
        "Starting Relay daemon"
    );

    // Durable store
    let store_config = StoreConfig::from_env();
    let store = Arc::new(
        PostgresWorkStore::connect(&store_config.database_url, store_config.max_connections)
            .await?,
    );
    store.ensure_schema().await?;
    info!("Durable store connected");

    // Transport
    let transport = Arc::new(NatsTransport::connect(NatsConfig::from_env()).await?);
    info!("Transport connected");

    // Registries are built at startup; a bare daemon runs them empty
    let registry = Arc::new(SerializerRegistry::new());
    install_global_registry(registry.clone());
    let dispatcher = Arc::new(HandlerRegistry::new());

    let instance = describe_instance(&config.service_name);
    let instance_id = instance.instance_id.as_str().to_string();
    info!(instance_id = %instance_id, "Instance identity minted");

    let strategy = Arc::new(CoordinatorStrategy::new(
        store.clone(),
        instance,
        store_config.batch_options(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Outbox publisher
    let outbox_worker = OutboxPublisherWorker::new(
        strategy.clone(),
        transport.clone(),
        OutboxWorkerConfig::default(),
    );
    let outbox_task = tokio::spawn({
        let signal = shutdown_rx.clone();
        async move { outbox_worker.run(signal).await }
    });

    // Inbox consumer, only when destinations are configured
    let inbox_task = if config.destinations.is_empty() {
        None
    } else {
        let worker = Arc::new(InboxConsumerWorker::new(
            strategy.clone(),
            transport.clone(),
            dispatcher.clone(),
            store.clone(),
            registry.clone(),
            ScopeFactory::new(),
            InboxWorkerConfig::for_destinations(config.destinations.clone()),
        ));
        let signal = shutdown_rx.clone();
        Some(tokio::spawn(async move { worker.run(signal).await }))
    };

    // Health server
    let state = Arc::new(DaemonState {
        config: config.clone(),
        instance_id,
        running: AtomicBool::new(true),
    });
    let health_state = state.clone();
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let health_app = Router::new()
        .route("/ready", get(move || ready_handler(health_state.clone())))
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }));

    let health_server = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(health_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %health_addr, error = %e, "Failed to bind health server");
                return;
            }
        };
        info!(addr = %health_addr, "Health server listening");
        if let Err(e) = axum::serve(listener, health_app).await {
            error!(error = %e, "Health server error");
        }
    });

    shutdown_signal().await;

    info!("Shutdown signal received, stopping workers");
    state.running.store(false, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), outbox_task).await;
    if let Some(task) = inbox_task {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(10), task).await;
    }
    health_server.abort();

    info!("Relay daemon shutdown complete");
    Ok(())
}

/// Health/readiness check handler
async fn ready_handler(state: Arc<DaemonState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.is_ready() { "ready" } else { "not_ready" },
        "service": state.config.service_name,
        "instance_id": state.instance_id,
        "destinations": state.config.destinations,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
