//! Mock relay push channel for testing the display client
//!
//! Speaks the `/ws` protocol: answers `state-request` with a fixed state and
//! `ping` with `pong`. The first N connections are closed right after their
//! state request is answered, to force reconnects.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct MockPushState {
    current: Value,
    drop_first: usize,
    connections: usize,
    /// Every text message received, across connections
    received: Vec<String>,
}

pub struct MockPushServer {
    addr: SocketAddr,
    state: Arc<Mutex<MockPushState>>,
    handle: JoinHandle<()>,
}

impl MockPushServer {
    /// Start serving `current` as the state; the first `drop_first` connections are cut
    pub async fn start(current: Value, drop_first: usize) -> Self {
        let state = Arc::new(Mutex::new(MockPushState {
            current,
            drop_first,
            connections: 0,
            received: Vec::new(),
        }));

        let app = Router::new()
            .route("/ws", get(handle_upgrade))
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

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connections(&self) -> usize {
        self.state.lock().await.connections
    }

    pub async fn received(&self) -> Vec<String> {
        self.state.lock().await.received.clone()
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<Mutex<MockPushState>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(socket: WebSocket, state: Arc<Mutex<MockPushState>>) {
    let (mut sender, mut receiver) = socket.split();
    let cut_after_state = {
        let mut state = state.lock().await;
        state.connections += 1;
        state.connections <= state.drop_first
    };

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let text = text.as_str().to_string();
        state.lock().await.received.push(text.clone());

        let request: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        match request["type"].as_str() {
            Some("state-request") => {
                let current = state.lock().await.current.clone();
                let reply = json!({"type": "state-update", "data": current}).to_string();
                if sender.send(Message::Text(reply.into())).await.is_err() {
                    return;
                }
                if cut_after_state {
                    let _ = sender.send(Message::Close(None)).await;
                    return;
                }
            }
            Some("ping") => {
                let reply = json!({"type": "pong"}).to_string();
                if sender.send(Message::Text(reply.into())).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}
