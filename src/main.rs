//! Operator API Proxy
//!
//! Main entry point. Connects to Kubernetes, starts the proxy watching every
//! namespace, and serves metrics.
//!
//! Owner kinds come from `OWNER_KINDS` (comma separated `group/version/Kind`).
//! Each gets a queue-backed controller entry, and the reconcile requests it
//! produces are logged. With `OWNER_KINDS` unset the controller map is empty,
//! so owners are still injected but no dependent watch is started.

use std::collections::HashSet;
use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use operator_api_proxy::{
    controllermap::{parse_owner_kinds, InMemoryControllerMap},
    watches::ReconcileRequest,
    metrics,
    proxy::{self, Options},
};

/// Default metrics port
const METRICS_PORT: u16 = 8080;

/// Owner kinds whose dependents are watched
const OWNER_KINDS_ENV: &str = "OWNER_KINDS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting Operator API Proxy");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let owners = parse_owner_kinds(&std::env::var(OWNER_KINDS_ENV).unwrap_or_default())?;
    if owners.is_empty() {
        warn!("{} is not set, dependent resources will not be watched", OWNER_KINDS_ENV);
    }
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let controllers = InMemoryControllerMap::queue_backed(owners, queue_tx);
    info!("Registered {} owner kinds", controllers.len());
    tokio::spawn(log_reconcile_requests(queue_rx));

    let mut options = Options::new(client);
    options.controller_map = Some(Arc::new(controllers));
    options.watched_namespaces = Some(HashSet::from([String::new()]));

    let (done_tx, done_rx) = oneshot::channel();
    let addr = proxy::run(done_tx, options).await?;
    info!("Proxy listening on {}", addr);

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(METRICS_PORT));
    info!("Metrics server starting on port {}", METRICS_PORT);

    // Handle graceful shutdown
    tokio::select! {
        result = done_rx => {
            match result {
                Ok(e) => error!("Proxy exited unexpectedly: {}", e),
                Err(_) => error!("Proxy exited unexpectedly"),
            }
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping proxy");
        }
    }

    info!("Operator API Proxy stopped");
    Ok(())
}

/// Drain reconcile requests raised by dependent events
async fn log_reconcile_requests(mut queue: mpsc::UnboundedReceiver<ReconcileRequest>) {
    while let Some(request) = queue.recv().await {
        info!(
            name = %request.name,
            namespace = request.namespace.as_deref().unwrap_or(""),
            "Owner reconcile requested"
        );
    }
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,operator_api_proxy=debug,kube=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
