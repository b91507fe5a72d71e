//! Terminal now-playing display
//!
//! Connects to a relay's push channel and logs status changes and the current
//! track. Reconnects forever with backoff; Ctrl+C exits.
//!
//! Usage:
//!   nowplaying-display [ws-url]
//!
//! The URL defaults to ws://localhost:3001/ws.

use plex_nowplaying::client::{self, ClientOptions, ConnectionStatus};
use plex_nowplaying::state::PlaybackState;

use std::env;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_URL: &str = "ws://localhost:3001/ws";

fn print_usage() {
    eprintln!("Usage: nowplaying-display [ws-url]");
    eprintln!();
    eprintln!("Shows what the relay says is playing. Default URL: {}", DEFAULT_URL);
}

fn describe(state: &PlaybackState) -> String {
    let m = &state.metadata;
    let mut line = m.title.clone();
    if !m.grandparent_title.is_empty() {
        line = format!("{} - {}", m.grandparent_title, line);
    }
    if !m.parent_title.is_empty() {
        line = format!("{} ({})", line, m.parent_title);
    }
    let status = if state.is_paused() { "paused" } else { "playing" };
    format!("{} [{} on {}]", line, status, state.player.title)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plex_nowplaying=info,nowplaying_display=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let url = match args.as_slice() {
        [] => DEFAULT_URL.to_string(),
        [flag] if flag == "-h" || flag == "--help" => {
            print_usage();
            return;
        }
        [url] if url.starts_with("ws://") || url.starts_with("wss://") => url.clone(),
        _ => {
            print_usage();
            process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let mut handle = client::spawn(url.clone(), ClientOptions::default(), shutdown.clone());
    tracing::info!("Watching {}", url);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = handle.status.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *handle.status.borrow_and_update();
                match status.status {
                    ConnectionStatus::Connected => tracing::info!("Connected"),
                    ConnectionStatus::Disconnected => tracing::info!(
                        attempts = status.reconnect_attempts,
                        "Disconnected"
                    ),
                    other => tracing::debug!("Status: {}", other),
                }
            }
            changed = handle.state.changed() => {
                if changed.is_err() {
                    break;
                }
                match handle.state.borrow_and_update().as_ref() {
                    Some(state) => tracing::info!(
                        event = %state.event,
                        artwork = state.metadata.artwork().unwrap_or("none"),
                        "Now playing: {}",
                        describe(state)
                    ),
                    None => tracing::info!("Nothing playing"),
                }
            }
        }
    }

    shutdown.cancel();
    handle.join().await;
}
