//! Display-side push client
//!
//! Keeps one logical connection to the relay's push channel alive forever:
//! connects, asks for the current state, pings every 30s, and on any close or
//! error waits out the backoff and tries again. State changes and status are
//! exposed as `watch` channels for the rendering layer.

pub mod machine;

pub use machine::{ClientMachine, ConnectionStatus, BACKOFF_SCHEDULE};

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::PlaybackState;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub keepalive: Duration,
    pub backoff: Vec<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            keepalive: KEEPALIVE_INTERVAL,
            backoff: BACKOFF_SCHEDULE.to_vec(),
        }
    }
}

/// Status as seen by the rendering layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatus {
    pub status: ConnectionStatus,
    /// Failed or closed connections since the last successful connect
    pub reconnect_attempts: u32,
}

pub struct ClientHandle {
    pub status: watch::Receiver<ClientStatus>,
    pub state: watch::Receiver<Option<PlaybackState>>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Wait for the driver to finish after its shutdown token was cancelled
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Push client task failed: {}", e);
        }
    }
}

enum SessionEnd {
    Closed,
    Failed,
    Shutdown,
}

struct Driver {
    url: String,
    keepalive: Duration,
    machine: ClientMachine,
    status_tx: watch::Sender<ClientStatus>,
    state_tx: watch::Sender<Option<PlaybackState>>,
    shutdown: CancellationToken,
}

/// Spawn the reconnecting client; it runs until `shutdown` is cancelled
pub fn spawn(url: impl Into<String>, options: ClientOptions, shutdown: CancellationToken) -> ClientHandle {
    let machine = ClientMachine::new(options.backoff);
    let (status_tx, status) = watch::channel(ClientStatus {
        status: machine.status(),
        reconnect_attempts: 0,
    });
    let (state_tx, state) = watch::channel(None);

    let driver = Driver {
        url: url.into(),
        keepalive: options.keepalive,
        machine,
        status_tx,
        state_tx,
        shutdown,
    };

    ClientHandle {
        status,
        state,
        task: tokio::spawn(driver.run()),
    }
}

impl Driver {
    fn report(&self) {
        self.status_tx.send_replace(ClientStatus {
            status: self.machine.status(),
            reconnect_attempts: self.machine.attempts(),
        });
    }

    async fn run(mut self) {
        loop {
            self.machine.begin_connect();
            self.report();
            debug!("Connecting to {}", self.url);

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((socket, _)) => {
                    info!("Connected to {}", self.url);
                    match self.session(socket).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Failed => {
                            self.machine.on_error();
                            self.report();
                        }
                        SessionEnd::Closed => {}
                    }
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", self.url, e);
                    self.machine.on_error();
                    self.report();
                }
            }

            let delay = self.machine.on_closed();
            self.report();
            info!(attempt = self.machine.attempts(), "Disconnected, reconnecting in {:?}", delay);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.machine.on_closed();
        self.report();
        debug!("Push client stopped");
    }

    async fn session<S>(&mut self, socket: S) -> SessionEnd
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        let hello = self.machine.on_connected();
        self.report();
        if let Err(e) = sink.send(Message::Text(hello.to_json())).await {
            warn!("Failed to request current state: {}", e);
            return SessionEnd::Failed;
        }

        let start = tokio::time::Instant::now() + self.keepalive;
        let mut keepalive = tokio::time::interval_at(start, self.keepalive);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    return SessionEnd::Shutdown;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = sink.send(Message::Text(ClientMessage::Ping.to_json())).await {
                        warn!("Keep-alive failed: {}", e);
                        return SessionEnd::Failed;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.on_text(&text),
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Push channel error: {}", e);
                        return SessionEnd::Failed;
                    }
                },
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to parse push message: {}", e);
                return;
            }
        };
        if self.machine.on_message(message) {
            self.state_tx.send_replace(self.machine.current().cloned());
        }
    }
}
