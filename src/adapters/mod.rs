//! Upstream media server access

pub mod plex;
pub mod retry;

pub use plex::{PlexClient, Session, UpstreamError};
pub use retry::{RetryDecision, RetryPolicy, Retryable};

use tracing::{info, warn};

use crate::state::{StateStore, StoreError};

/// Seed the store from the server's active session before webhooks arrive.
///
/// An unreachable server or an idle one leaves the store alone; only a
/// failed store write is an error. Returns whether a state was saved.
pub async fn seed_store(plex: &PlexClient, store: &dyn StateStore) -> Result<bool, StoreError> {
    if !plex.test_connectivity().await {
        warn!("Plex server at {} is unreachable, starting without a seeded state", plex.base_url());
        return Ok(false);
    }

    match plex.fetch_current_state().await {
        Ok(Some(state)) => {
            info!(title = %state.metadata.title, paused = state.is_paused(), "Seeded state from active Plex session");
            store.save(&state).await?;
            Ok(true)
        }
        Ok(None) => {
            info!("No active Plex session for the configured user");
            Ok(false)
        }
        Err(e) => {
            warn!("Failed to fetch Plex sessions: {}", e);
            Ok(false)
        }
    }
}
