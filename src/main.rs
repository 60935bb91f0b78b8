use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use notification_relay::config::RelayConfig;
use notification_relay::registry::ConnectionRegistry;
use notification_relay::router::EventRouter;
use notification_relay::server::{create_router, AppState};
use notification_relay::store::{self, StoreHandle};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let config = RelayConfig::from_env();
    tracing::info!(port = config.port, "Starting notification relay service");

    // Store failure at boot is fatal only when configured so; otherwise
    // the relay degrades to fan-out-only operation.
    let (store_handle, writer) = match store::init(&config) {
        Ok(backend) => {
            let (handle, task) = store::spawn_writer(backend);
            (handle, Some(task))
        }
        Err(error) if config.store_required => return Err(error.into()),
        Err(error) => {
            tracing::warn!(%error, "event store unavailable, persistence disabled");
            (StoreHandle::disabled(), None)
        }
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(EventRouter::new(
        registry.clone(),
        store_handle.clone(),
        config.history_cap,
    ));
    let app = create_router(AppState {
        registry: registry.clone(),
        router,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);
    tracing::info!("Health check available at http://{}/health", addr);

    // Ordered teardown: the shutdown future stops the listener and
    // closes every connection so in-flight sockets can drain; the store
    // flushes and its writer exits once the server has stopped.
    let shutdown_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_registry.close_all();
        })
        .await?;

    store_handle.flush().await;
    drop(store_handle);
    if let Some(task) = writer {
        task.await.ok();
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}
