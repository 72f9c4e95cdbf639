//! Parley signaling service.
//!
//! Startup flow:
//! 1. Load configuration from environment
//! 2. Spawn the media engine worker (fatal if it ever dies)
//! 3. Start the actor system (room supervisor)
//! 4. Serve signaling (WebSocket), room metadata REST and health probes
//!    from one HTTP listener
//! 5. Wait for a shutdown signal, then drain gracefully

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use media_engine::loopback::{LoopbackWorker, WorkerSettings};
use media_engine::EngineWorker;
use signal_service::actors::RoomSupervisorHandle;
use signal_service::config::Config;
use signal_service::observability::{health_router, HealthState};
use signal_service::signaling::{self, GatewayState};
use signal_service::store::{self, RoomStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period between cancellation and process exit.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_service=debug,media_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Parley signaling service");

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        anyhow::anyhow!(e.to_string())
    })?;
    info!(
        bind_address = %config.bind_address,
        announced_ip = %config.announced_ip,
        record_port_range = format!("{}-{}", config.record_min_port, config.record_max_port),
        recording_dir = %config.recording_dir.display(),
        "Configuration loaded"
    );
    let config = Arc::new(config);

    let health_state = Arc::new(HealthState::new());

    // One engine worker per process. Its death is unrecoverable for every
    // in-flight session, so the process must go down with it.
    let worker = LoopbackWorker::spawn(WorkerSettings {
        rtc_min_port: config.rtc_min_port,
        rtc_max_port: config.rtc_max_port,
        resource_interval: config.resource_interval,
    });
    let worker_closed = worker.closed();
    info!(worker_id = %worker.id(), "Engine worker started");

    let root_token = CancellationToken::new();
    let supervisor = RoomSupervisorHandle::new(
        worker.clone() as Arc<dyn EngineWorker>,
        Arc::clone(&config),
        root_token.child_token(),
    );
    info!("Actor system initialized");

    let app = signaling::router(GatewayState {
        supervisor: supervisor.clone(),
    })
    .merge(store::router(RoomStore::new()))
    .merge(health_router(Arc::clone(&health_state)))
    .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        anyhow::anyhow!("invalid bind address {}: {e}", config.bind_address)
    })?;

    // Bind before spawning to fail fast on bind errors.
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind listener");
        anyhow::anyhow!("failed to bind {addr}: {e}")
    })?;
    info!(addr = %addr, "Listener bound");

    let server_token = root_token.child_token();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    health_state.set_ready();
    info!("Parley signaling service running");

    let engine_died = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
            false
        }
        () = worker_closed.cancelled() => {
            error!("Engine worker died, terminating");
            true
        }
    };

    health_state.set_not_ready();
    root_token.cancel();
    worker.close();

    tokio::time::sleep(SHUTDOWN_DRAIN).await;
    server.abort();

    if engine_died {
        return Err(anyhow::anyhow!("engine worker died"));
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
