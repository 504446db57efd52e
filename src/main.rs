use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use notify_dispatch_service::config::Settings;
use notify_dispatch_service::server::{create_app, AppState};
use notify_dispatch_service::shutdown::{GracefulShutdown, ShutdownConfig};
use notify_dispatch_service::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing (guard must be held until shutdown)
    let _telemetry_guard = init_telemetry(&settings.logging, &settings.otel)?;
    tracing::info!("Configuration loaded");

    if settings.api.key.is_none() {
        tracing::warn!("No API key configured, all endpoints are open");
    }

    // Create application state
    let state = AppState::new(settings.clone()).await?;
    tracing::info!(
        channels = ?state.dispatcher.channels(),
        templates = %state.renderer.root().display(),
        "Application state initialized"
    );

    // Recover unfinished jobs and start workers
    let recovered = state.workers.start().await?;
    if recovered > 0 {
        tracing::info!(recovered, "Recovered unfinished jobs from previous run");
    }

    // Start rate limiter cleanup in background
    let cleanup_handle = state
        .rate_limiter
        .spawn_cleanup(Duration::from_secs(settings.ratelimit.cleanup_interval_seconds));

    let shutdown = GracefulShutdown::new(
        state.workers.clone(),
        state.store.clone(),
        ShutdownConfig {
            worker_timeout: settings.queue.shutdown_timeout(),
        },
    )
    .with_background_task(cleanup_handle);

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let result = shutdown.execute("server stopped").await;
    if !result.success {
        tracing::warn!(pending_jobs = result.pending_jobs, "Shutdown finished with unfinished work");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
