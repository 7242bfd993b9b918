//! Media Worker Service
//!
//! Runs a pool of media workers and exposes them to cluster clients over
//! NATS.
//!
//! # Servers
//!
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8090)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to NATS
//! 4. Start health HTTP server (liveness, readiness, metrics)
//! 5. Start the worker pool
//! 6. Wait for shutdown signal, then close every worker (dead reports)

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use common::bus::{Bus, NatsBus};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_service::config::Config;
use worker_service::engine::{LoopbackConfig, LoopbackEngine, MediaEngine};
use worker_service::observability::{health_router, init_metrics_recorder, HealthState};
use worker_service::pool::{EngineFactory, WorkerPool};
use worker_service::worker::WorkerOptions;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first: it carries the default log level
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Media Worker Service");
    info!(
        worker_count = config.worker_count,
        listen_ip = %config.listen_ip,
        announce_ip = %config.announce_ip,
        min_port = config.min_port,
        max_port = config.max_port,
        root_topic = %config.root_topic,
        nats = %config.bus.server_list(),
        report_interval_ms = u64::try_from(config.report_interval.as_millis()).unwrap_or(u64::MAX),
        health_bind_address = %config.health_bind_address,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    info!("Connecting to NATS...");
    let bus: Arc<dyn Bus> = Arc::new(NatsBus::connect(&config.bus).await.map_err(|e| {
        error!(error = %e, "Failed to connect to NATS");
        e
    })?);
    info!("NATS connection established");

    // Health server (MUST succeed - fail startup if it doesn't)
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
    let app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let engine_config = LoopbackConfig {
        listen_ip: config.listen_ip.clone(),
        announce_ip: config.announce_ip.clone(),
        min_port: config.min_port,
        max_port: config.max_port,
    };
    let factory: EngineFactory = Arc::new(move || {
        Arc::new(LoopbackEngine::new(engine_config.clone())) as Arc<dyn MediaEngine>
    });

    let options = WorkerOptions {
        root_topic: config.root_topic.clone(),
        app_data: config.app_data(),
        report_interval: config.report_interval,
    };

    let pool = WorkerPool::start(
        Arc::clone(&bus),
        factory,
        options,
        config.worker_count,
        Arc::clone(&health_state),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start worker pool");
        e
    })?;
    health_state.set_ready();

    for worker in pool.workers() {
        info!(worker_id = %worker.id(), "Worker ready");
    }
    info!("Media Worker Service running - press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Workers publish their dead reports before the bus goes away
    pool.close().await;
    shutdown_token.cancel();

    info!("Media Worker Service shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        () = ctrl_c => {},
        () = terminate => {},
    }
}
