//! Mock Plex Media Server for testing
//!
//! Serves the identity endpoint (`/`), `/status/sessions`, and the image
//! transcoder. Failures can be scripted per request to exercise retries.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub const MOCK_IMAGE: &[u8] = b"\xFF\xD8\xFFmock-jpeg";

/// Mock Plex server state
struct MockPlexState {
    token: String,
    machine_identifier: Option<String>,
    sessions: Vec<Value>,
    /// Status codes returned by the next session requests, in order
    scripted_failures: VecDeque<StatusCode>,
    response_delay: Duration,
    session_requests: usize,
    identity_requests: usize,
    photo_requests: usize,
}

/// Mock Plex Server
pub struct MockPlexServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockPlexState>>,
    handle: JoinHandle<()>,
}

impl MockPlexServer {
    /// Start a mock Plex server on a random port that accepts `token`
    pub async fn start(token: &str) -> Self {
        let state = Arc::new(RwLock::new(MockPlexState {
            token: token.to_string(),
            machine_identifier: Some("mock-machine-id".to_string()),
            sessions: Vec::new(),
            scripted_failures: VecDeque::new(),
            response_delay: Duration::ZERO,
            session_requests: 0,
            identity_requests: 0,
            photo_requests: 0,
        }));

        // The transcoder path has a literal ':' segment, so it is matched in the fallback
        let app = Router::new()
            .route("/", get(handle_identity))
            .route("/status/sessions", get(handle_sessions))
            .fallback(handle_fallback)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL including scheme, usable as `server_url`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Add a raw `MediaContainer.Metadata[]` entry
    pub async fn add_session(&self, session: Value) {
        self.state.write().await.sessions.push(session);
    }

    /// Answer the next session requests with these status codes
    pub async fn fail_next(&self, statuses: &[u16]) {
        let mut state = self.state.write().await;
        for status in statuses {
            state
                .scripted_failures
                .push_back(StatusCode::from_u16(*status).unwrap());
        }
    }

    pub async fn set_response_delay(&self, delay: Duration) {
        self.state.write().await.response_delay = delay;
    }

    pub async fn set_machine_identifier(&self, id: Option<&str>) {
        self.state.write().await.machine_identifier = id.map(str::to_string);
    }

    pub async fn session_requests(&self) -> usize {
        self.state.read().await.session_requests
    }

    pub async fn identity_requests(&self) -> usize {
        self.state.read().await.identity_requests
    }

    pub async fn photo_requests(&self) -> usize {
        self.state.read().await.photo_requests
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
    }
}

/// A music session as Plex reports it
pub fn track_session(username: &str, title: &str, player_state: &str) -> Value {
    json!({
        "guid": format!("plex://track/{}", title),
        "sessionKey": "12",
        "ratingKey": "5001",
        "key": "/library/metadata/5001",
        "type": "track",
        "title": title,
        "grandparentTitle": "Mock Artist",
        "parentTitle": "Mock Album",
        "thumb": "/library/metadata/5000/thumb/1700000000",
        "index": 3,
        "parentIndex": 1,
        "parentYear": 2021,
        "duration": 240000,
        "viewOffset": 60000,
        "User": {"id": "1", "title": username, "thumb": "https://plex.tv/users/1/avatar"},
        "Player": {
            "title": "Kitchen",
            "address": "192.168.1.50",
            "machineIdentifier": "kitchen-1",
            "platform": "Plexamp",
            "state": player_state
        }
    })
}

fn authorized(state: &MockPlexState, headers: &HeaderMap) -> bool {
    headers
        .get("X-Plex-Token")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|t| t == state.token)
}

async fn handle_identity(
    State(state): State<Arc<RwLock<MockPlexState>>>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.write().await;
    state.identity_requests += 1;
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut container = json!({"size": 0, "friendlyName": "Mock Plex"});
    if let Some(id) = &state.machine_identifier {
        container["machineIdentifier"] = json!(id);
    }
    Json(json!({ "MediaContainer": container })).into_response()
}

async fn handle_sessions(
    State(state): State<Arc<RwLock<MockPlexState>>>,
    headers: HeaderMap,
) -> Response {
    let (delay, outcome) = {
        let mut state = state.write().await;
        state.session_requests += 1;

        let outcome = if !authorized(&state, &headers) {
            Err(StatusCode::UNAUTHORIZED)
        } else if let Some(status) = state.scripted_failures.pop_front() {
            Err(status)
        } else {
            Ok(json!({
                "MediaContainer": {
                    "size": state.sessions.len(),
                    "Metadata": state.sessions.clone()
                }
            }))
        };
        (state.response_delay, outcome)
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    match outcome {
        Ok(body) => Json(body).into_response(),
        Err(status) => status.into_response(),
    }
}

async fn handle_fallback(State(state): State<Arc<RwLock<MockPlexState>>>, uri: Uri) -> Response {
    if uri.path() != "/photo/:/transcode" {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut state = state.write().await;
    state.photo_requests += 1;

    let token_param = format!("X-Plex-Token={}", state.token);
    let query = uri.query().unwrap_or("");
    if !query.split('&').any(|pair| pair == token_param) || !query.contains("url=") {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ([(header::CONTENT_TYPE, "image/jpeg")], MOCK_IMAGE).into_response()
}
