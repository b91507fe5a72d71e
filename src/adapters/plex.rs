//! Plex Media Server HTTP client
//!
//! Polls `/status/sessions` for what is currently playing and turns the result
//! into a `PlaybackState`. Used at startup to seed the store before the first
//! webhook arrives, and by the debug endpoints.
//!
//! Every request carries the `X-Plex-Token` header, runs under a per-attempt
//! deadline, and is retried per `RetryPolicy`: 5xx, network errors and timeouts
//! are retried, 4xx and cancellation are not.

use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::retry::{RetryDecision, RetryPolicy, Retryable};
use crate::config::PlexConfig;
use crate::state::{EventKind, MediaMetadata, PlaybackState, PlayerInfo};

const SESSIONS_ENDPOINT: &str = "/status/sessions";
const IDENTITY_ENDPOINT: &str = "/";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Plex API client error: {0}")]
    Client(StatusCode),

    #[error("Plex API error: {0}")]
    Server(StatusCode),

    #[error("Plex request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Plex request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("invalid Plex response body: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("Plex request cancelled")]
    Cancelled,
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        !matches!(self, UpstreamError::Client(_) | UpstreamError::Cancelled)
    }
}

/// Playback status reported for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Playing,
    Paused,
    Buffering,
}

impl SessionStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "paused" => Self::Paused,
            "buffering" => Self::Buffering,
            _ => Self::Playing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMedia {
    pub title: String,
    pub grandparent_title: String,
    pub parent_title: String,
    pub thumb: String,
    pub art: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub index: i64,
    pub parent_index: i64,
    pub year: Option<i64>,
    pub rating_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPlayer {
    pub title: String,
    pub address: String,
    pub machine_identifier: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeInfo {
    pub video_decision: String,
    pub audio_decision: String,
    pub throttled: bool,
    pub progress: f64,
}

/// One active playback session as reported by the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub session_key: String,
    pub username: String,
    pub user_thumb: String,
    pub duration: i64,
    pub view_offset: i64,
    /// Percent played, 0-100
    pub progress: u8,
    pub state: SessionStatus,
    pub media: SessionMedia,
    pub player: SessionPlayer,
    pub transcode: Option<TranscodeInfo>,
}

impl Session {
    pub fn to_playback_state(&self, timestamp: i64) -> PlaybackState {
        let paused = self.state == SessionStatus::Paused;
        let library_section_type = match self.media.media_type.as_str() {
            "track" => "artist",
            "episode" => "show",
            _ => "movie",
        };

        let metadata = MediaMetadata {
            library_section_type: library_section_type.to_string(),
            rating_key: self.media.rating_key.clone(),
            key: format!("/library/metadata/{}", self.media.rating_key),
            media_type: self.media.media_type.clone(),
            title: self.media.title.clone(),
            grandparent_title: self.media.grandparent_title.clone(),
            parent_title: self.media.parent_title.clone(),
            index: self.media.index,
            parent_index: self.media.parent_index,
            thumb: self.media.thumb.clone(),
            art: self.media.art.clone(),
            parent_year: self.media.year,
            ..Default::default()
        };

        let player = PlayerInfo {
            local: false,
            public_address: self.player.address.clone(),
            title: self.player.title.clone(),
            uuid: self.player.machine_identifier.clone(),
        };

        let event = if paused { EventKind::Pause } else { EventKind::Play };
        PlaybackState::new(event, metadata, player, timestamp)
    }
}

// =============================================================================
// Field access with defaults for missing or mistyped values
// =============================================================================

fn str_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn float_field(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn int_field(v: &Value, key: &str) -> Option<i64> {
    float_field(v, key).map(|f| f as i64)
}

fn flag_field(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "1" || s == "true",
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn progress_percent(view_offset: i64, duration: i64) -> u8 {
    if view_offset <= 0 || duration <= 0 {
        return 0;
    }
    let pct = (view_offset as f64 / duration as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Map one raw `MediaContainer.Metadata[]` entry; missing fields get defaults
pub fn normalize_session(raw: &Value) -> Session {
    let user = raw.get("User").cloned().unwrap_or(Value::Null);
    let player = raw.get("Player").cloned().unwrap_or(Value::Null);

    let duration = int_field(raw, "duration").unwrap_or(0);
    let view_offset = int_field(raw, "viewOffset").unwrap_or(0);

    let transcode = raw.get("TranscodeSession").filter(|t| t.is_object()).map(|t| TranscodeInfo {
        video_decision: str_field(t, "videoDecision").unwrap_or_default(),
        audio_decision: str_field(t, "audioDecision").unwrap_or_default(),
        throttled: flag_field(t, "throttled"),
        progress: float_field(t, "progress").unwrap_or(0.0),
    });

    Session {
        id: str_field(raw, "guid")
            .or_else(|| str_field(raw, "key"))
            .unwrap_or_default(),
        session_key: str_field(raw, "sessionKey").unwrap_or_default(),
        username: str_field(&user, "title").unwrap_or_else(|| "Unknown".to_string()),
        user_thumb: str_field(&user, "thumb").unwrap_or_default(),
        duration,
        view_offset,
        progress: progress_percent(view_offset, duration),
        state: SessionStatus::parse(&str_field(&player, "state").unwrap_or_default()),
        media: SessionMedia {
            title: str_field(raw, "title").unwrap_or_default(),
            grandparent_title: str_field(raw, "grandparentTitle").unwrap_or_default(),
            parent_title: str_field(raw, "parentTitle").unwrap_or_default(),
            thumb: str_field(raw, "thumb").unwrap_or_default(),
            art: str_field(raw, "art").unwrap_or_default(),
            media_type: str_field(raw, "type").unwrap_or_default(),
            index: int_field(raw, "index").unwrap_or(0),
            parent_index: int_field(raw, "parentIndex").unwrap_or(0),
            year: int_field(raw, "year").or_else(|| int_field(raw, "parentYear")),
            rating_key: str_field(raw, "ratingKey").unwrap_or_default(),
        },
        player: SessionPlayer {
            title: str_field(&player, "title").unwrap_or_else(|| "Unknown Player".to_string()),
            address: str_field(&player, "address").unwrap_or_default(),
            machine_identifier: str_field(&player, "machineIdentifier").unwrap_or_default(),
            platform: str_field(&player, "platform").unwrap_or_default(),
        },
        transcode,
    }
}

/// Session for `username` when one is configured, else the first session
pub fn select_session(sessions: Vec<Session>, username: Option<&str>) -> Option<Session> {
    match username.filter(|u| !u.is_empty()) {
        Some(name) => sessions.into_iter().find(|s| s.username == name),
        None => sessions.into_iter().next(),
    }
}

/// Build the server base URL; a `server_url` that already has a scheme is used as-is
pub fn build_base_url(server_url: &str, port: u16) -> String {
    let trimmed = server_url.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}:{}", trimmed, port)
    }
}

// =============================================================================
// Client
// =============================================================================

pub struct PlexClient {
    http: Client,
    base_url: String,
    token: String,
    username: Option<String>,
    retry: RetryPolicy,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl PlexClient {
    pub fn new(config: &PlexConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            http,
            base_url: build_base_url(&config.server_url, config.server_port),
            token: config.token.clone(),
            username: Some(config.username.clone()).filter(|u| !u.is_empty()),
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Cancel in-flight requests and backoff sleeps when `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// One request attempt under the per-attempt deadline
    async fn attempt(&self, url: &str) -> Result<Value, UpstreamError> {
        let exchange = async {
            let response = self
                .http
                .get(url)
                .header("X-Plex-Token", &self.token)
                .header(ACCEPT, "application/json")
                .send()
                .await
                .map_err(UpstreamError::Network)?;

            let status = response.status();
            if status.is_client_error() {
                return Err(UpstreamError::Client(status));
            }
            if !status.is_success() {
                return Err(UpstreamError::Server(status));
            }
            response.json::<Value>().await.map_err(UpstreamError::Decode)
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(UpstreamError::Cancelled),
            result = tokio::time::timeout(self.request_timeout, exchange) => {
                result.unwrap_or_else(|_| Err(UpstreamError::Timeout(self.request_timeout)))
            }
        }
    }

    /// GET `endpoint` with retry/backoff, returning the decoded JSON body
    pub async fn get_json(&self, endpoint: &str) -> Result<Value, UpstreamError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut attempt = 0u32;

        loop {
            let error = match self.attempt(&url).await {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };

            match self.retry.decide(attempt, &error) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        "Retrying Plex API request {} (attempt {}/{}) in {:?}: {}",
                        endpoint,
                        attempt + 2,
                        self.retry.max_attempts,
                        delay,
                        error
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(UpstreamError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    warn!(
                        "Plex API request {} failed after {} attempt(s): {}",
                        endpoint,
                        attempt + 1,
                        error
                    );
                    return Err(error);
                }
            }
        }
    }

    /// All active sessions; a response without a session list means none
    pub async fn sessions(&self) -> Result<Vec<Session>, UpstreamError> {
        let body = self.get_json(SESSIONS_ENDPOINT).await?;

        let sessions = body
            .get("MediaContainer")
            .and_then(|c| c.get("Metadata"))
            .and_then(|m| m.as_array())
            .map(|entries| entries.iter().map(normalize_session).collect())
            .unwrap_or_default();

        Ok(sessions)
    }

    pub async fn current_user_session(&self) -> Result<Option<Session>, UpstreamError> {
        let sessions = self.sessions().await?;
        Ok(select_session(sessions, self.username.as_deref()))
    }

    /// Current state derived from the active session, stamped with now
    pub async fn fetch_current_state(&self) -> Result<Option<PlaybackState>, UpstreamError> {
        let now = chrono::Utc::now().timestamp_millis();
        Ok(self
            .current_user_session()
            .await?
            .map(|session| session.to_playback_state(now)))
    }

    /// True when the server answers its identity endpoint
    pub async fn test_connectivity(&self) -> bool {
        match self.get_json(IDENTITY_ENDPOINT).await {
            Ok(body) => {
                let identifier = body
                    .get("MediaContainer")
                    .and_then(|c| c.get("machineIdentifier"));
                match identifier {
                    Some(id) if !id.is_null() => {
                        info!("Connected to Plex server {}", id);
                        true
                    }
                    _ => {
                        warn!("Plex identity response has no machineIdentifier");
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Plex connection test failed: {}", e);
                false
            }
        }
    }

    /// Image-transcode URL for an artwork reference; None for an empty reference
    pub fn artwork_url(&self, thumb: &str, width: u32, height: u32) -> Option<String> {
        if thumb.is_empty() {
            return None;
        }
        let mut url = Url::parse(&format!("{}/photo/:/transcode", self.base_url)).ok()?;
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string())
            .append_pair("minSize", "1")
            .append_pair("upscale", "1")
            .append_pair("url", thumb)
            .append_pair("X-Plex-Token", &self.token);
        Some(url.into())
    }
}
