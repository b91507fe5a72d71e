//! Plex now-playing relay server

use plex_nowplaying::{adapters, api, artwork, config, hub, state};

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
                .unwrap_or_else(|_| "plex_nowplaying=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Plex now-playing relay v{} ({})",
        env!("NOWPLAYING_VERSION"),
        env!("NOWPLAYING_GIT_SHA")
    );

    let config = config::load_config()?;
    config.validate()?;
    tracing::info!(
        "Configuration loaded, port: {}, Plex: {}:{}",
        config.port,
        config.plex.server_url,
        config.plex.server_port
    );
    if config.plex.username.is_empty() {
        tracing::warn!("No Plex username configured; every webhook will be ignored");
    }

    let data_dir = config::get_data_dir();
    let store: state::SharedStore = Arc::new(state::FileStateStore::new(&data_dir));
    tracing::info!("State store at {}", data_dir.display());

    let shutdown = CancellationToken::new();

    let plex = adapters::PlexClient::new(&config.plex)
        .context("Failed to build Plex HTTP client")?
        .with_shutdown(shutdown.clone());

    // Seed before accepting events so the first display sees what is playing
    adapters::seed_store(&plex, store.as_ref()).await?;

    let hub = hub::BroadcastHub::start(store.clone(), config.hub.to_hub_config(), shutdown.clone());
    let artwork = artwork::ArtworkCache::new(&data_dir, plex.http().clone());

    let state = api::AppState::new(store, hub, Arc::new(plex), artwork, config.plex.username.clone());
    let app = api::router(state);

    // Start server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
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
