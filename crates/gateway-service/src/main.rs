//! Gateway Service
//!
//! Realtime chat/voice gateway. Runs two HTTP servers:
//! - Gateway websocket endpoint `GET /gateway` (default: 0.0.0.0:8080)
//! - Health endpoints and Prometheus `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Install Prometheus metrics recorder
//! 4. Build the gateway service graph
//! 5. Start health server
//! 6. Start gateway server and mark ready
//!
//! # Shutdown
//!
//! SIGTERM/SIGINT marks the service not ready, closes every connection with
//! `ServerShutdown`, and stops both servers.

use axum::Router;
use gateway_service::config::Config;
use gateway_service::email::LogEmailSender;
use gateway_service::gateway::gateway_router;
use gateway_service::observability::metrics::init_metrics_recorder;
use gateway_service::observability::{health_router, HealthState};
use gateway_service::repository::InMemoryRepository;
use gateway_service::Gateway;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gateway Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        signing_key_id = %config.signing_key_id,
        max_message_length = config.max_message_length,
        outbound_queue_capacity = config.outbound_queue_capacity,
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    warn!("No storage backend configured, using in-memory repository");
    let gateway = Arc::new(
        Gateway::new(
            config.clone(),
            Arc::new(InMemoryRepository::new()),
            Arc::new(LogEmailSender),
        )
        .map_err(|e| {
            error!(error = %e, "Failed to build gateway");
            e
        })?,
    );

    // Health server: bind before spawning to fail fast
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);
    let health_listener = tokio::net::TcpListener::bind(health_addr).await.map_err(|e| {
        error!(error = %e, addr = %health_addr, "Failed to bind health server");
        format!("Failed to bind health server to {health_addr}: {e}")
    })?;

    let health_shutdown = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        let server = axum::serve(health_listener, health_app)
            .with_graceful_shutdown(async move { health_shutdown.cancelled().await });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = gateway_router(Arc::clone(&gateway)).layer(TraceLayer::new_for_http());

    health_state.mark_accepting();
    info!("Gateway listening on {}", addr);

    let server_shutdown = shutdown_token.child_token();
    {
        let health_state = Arc::clone(&health_state);
        let gateway = Arc::clone(&gateway);
        let shutdown_token = shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            health_state.begin_drain();
            gateway.shutdown();
            shutdown_token.cancel();
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    if let Err(e) = health_task.await {
        warn!(error = %e, "Health server task ended abnormally");
    }
    info!("Gateway Service shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
