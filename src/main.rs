//! DJAMMS player
//!
//! Local playback orchestrator with live status broadcast and chunked uploads.

use djamms_player::{api, bus, catalog, config, player, upload};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "djamms_player=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting DJAMMS player v{} ({})",
        env!("DJAMMS_VERSION"),
        env!("DJAMMS_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config()?;
    tracing::info!("Configuration loaded, port: {}", config.port);

    let media_dir = config.media_dir();
    let scratch_dir = config.scratch_dir();
    for dir in [&media_dir, &scratch_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    // Catalog
    let library = config.library_path();
    let catalog = catalog::load_library(&library, &media_dir)?;
    tracing::info!(
        "Catalog loaded from {}: {} tracks",
        library.display(),
        catalog.len().await
    );

    let broadcaster = bus::create_broadcaster();
    let shutdown = CancellationToken::new();

    // Player controller owns the playback processes
    let (player, player_task) = player::PlayerController::spawn(
        &config.player,
        Arc::new(catalog),
        broadcaster.clone(),
        shutdown.child_token(),
    );
    tracing::info!(
        decoder = %config.player.decoder.program,
        output = %config.player.output.program,
        "Player controller initialized"
    );

    let uploads = Arc::new(
        upload::ChunkedUploadTracker::new(&scratch_dir, &media_dir)
            .with_broadcaster(broadcaster.clone()),
    );

    let state = api::AppState::new(
        player,
        uploads,
        broadcaster.clone(),
        config.player.stop_on_disconnect,
    );
    let app = api::router(state);

    // Start server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    // Observer sockets and event streams never end on their own; closing
    // their channels lets the server drain
    let graceful = {
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
            broadcaster.close_all();
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await?;

    // Cleanup: wait for the controller to stop its playback processes
    tracing::info!("Stopping player...");
    shutdown.cancel();
    if let Err(e) = player_task.await {
        tracing::warn!("Player controller ended abnormally: {}", e);
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
