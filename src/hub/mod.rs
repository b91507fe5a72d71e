//! Broadcast hub - fans state updates out to live push connections
//!
//! One task (the hub loop) owns the connection set. Socket tasks, the webhook
//! gateway and the heartbeat ticker all talk to it through a bounded command
//! channel, so every mutation of the set is serialized on that loop.
//!
//! ```text
//! socket task ──Register/Inbound/Pong/Disconnected──┐
//! gateway ─────────────────────Publish──────────────┼──> hub loop ──Outbound──> socket task
//! ticker ──────────────────────Heartbeat────────────┘
//! ```

pub mod connection;

pub use connection::{
    ConnectionEvent, ConnectionId, ConnectionPhase, InvalidTransition, Liveness, Outbound, Probe,
};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{PlaybackState, SharedStore};
use connection::Connection;

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interval between liveness probes; a peer that misses one is dropped
    pub heartbeat_interval: Duration,
    /// Capacity of the hub's command channel
    pub command_buffer: usize,
    /// Per-connection outbound queue; a connection that fills it is dropped
    pub outbound_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            command_buffer: 256,
            outbound_buffer: 32,
        }
    }
}

/// Anything that can push a new state to displays
#[async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish(&self, state: PlaybackState);
}

/// A registered connection: its id and the frames the hub wants written to it
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Snapshot of one tracked connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub phase: ConnectionPhase,
    pub alive: bool,
}

enum HubCommand {
    Register {
        reply: oneshot::Sender<Registration>,
    },
    Inbound {
        id: ConnectionId,
        message: ClientMessage,
    },
    Pong {
        id: ConnectionId,
    },
    Disconnected {
        id: ConnectionId,
    },
    Publish {
        state: PlaybackState,
    },
    Heartbeat,
    Connections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
}

/// Handle to the hub loop; cheap to clone
#[derive(Clone)]
pub struct BroadcastHub {
    commands: mpsc::Sender<HubCommand>,
}

impl BroadcastHub {
    /// Spawn the hub loop. It runs until `shutdown` is cancelled.
    pub fn start(store: SharedStore, config: HubConfig, shutdown: CancellationToken) -> Self {
        let (commands, rx) = mpsc::channel(config.command_buffer);
        let hub_loop = HubLoop {
            store,
            outbound_buffer: config.outbound_buffer,
            connections: HashMap::new(),
            next_id: 1,
            commands: rx,
        };
        tokio::spawn(hub_loop.run(config.heartbeat_interval, shutdown));
        Self { commands }
    }

    async fn send(&self, command: HubCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("Hub loop has stopped, dropping command");
        }
    }

    /// Register a new connection. The current state (if any) is already queued
    /// on the returned receiver.
    pub async fn register(&self) -> Option<Registration> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Register { reply }).await;
        rx.await.ok()
    }

    pub async fn inbound(&self, id: ConnectionId, message: ClientMessage) {
        self.send(HubCommand::Inbound { id, message }).await;
    }

    pub async fn pong(&self, id: ConnectionId) {
        self.send(HubCommand::Pong { id }).await;
    }

    pub async fn disconnected(&self, id: ConnectionId) {
        self.send(HubCommand::Disconnected { id }).await;
    }

    /// Run one heartbeat round immediately (the loop also runs them on its timer)
    pub async fn heartbeat(&self) {
        self.send(HubCommand::Heartbeat).await;
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Connections { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections().await.len()
    }
}

#[async_trait]
impl StatePublisher for BroadcastHub {
    async fn publish(&self, state: PlaybackState) {
        self.send(HubCommand::Publish { state }).await;
    }
}

struct HubLoop {
    store: SharedStore,
    outbound_buffer: usize,
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
    commands: mpsc::Receiver<HubCommand>,
}

impl HubLoop {
    async fn run(mut self, heartbeat_interval: Duration, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + heartbeat_interval;
        let mut ticker = tokio::time::interval_at(start, heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Broadcast hub started (heartbeat {:?})", heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat(),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        for id in self.connections.keys().copied().collect::<Vec<_>>() {
            self.close(id);
        }
        info!("Broadcast hub stopped");
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { reply } => self.register(reply).await,
            HubCommand::Inbound { id, message } => self.inbound(id, message).await,
            HubCommand::Pong { id } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.liveness.pong(Instant::now());
                }
            }
            HubCommand::Disconnected { id } => {
                if let Some(mut conn) = self.connections.remove(&id) {
                    if let Err(e) = conn.transition(ConnectionEvent::Closed) {
                        debug!(connection = id, "{}", e);
                    }
                    info!(connection = id, remaining = self.connections.len(), "Client disconnected");
                }
            }
            HubCommand::Publish { state } => self.publish(state),
            HubCommand::Heartbeat => self.heartbeat(),
            HubCommand::Connections { reply } => {
                let mut list: Vec<ConnectionInfo> = self
                    .connections
                    .iter()
                    .map(|(id, conn)| ConnectionInfo {
                        id: *id,
                        phase: conn.phase(),
                        alive: conn.liveness.is_alive(),
                    })
                    .collect();
                list.sort_by_key(|c| c.id);
                if reply.send(list).is_err() {
                    debug!("Connection snapshot requester went away");
                }
            }
        }
    }

    async fn current_state(&self) -> Option<PlaybackState> {
        match self.store.load().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to load current state: {}", e);
                None
            }
        }
    }

    async fn register(&mut self, reply: oneshot::Sender<Registration>) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let mut conn = Connection::new(tx, Instant::now());

        if let Some(state) = self.current_state().await {
            conn.deliver(Outbound::Message(ServerMessage::state(Some(state))));
        }

        if let Err(e) = conn.transition(ConnectionEvent::Opened) {
            warn!(connection = id, "{}", e);
            return;
        }

        if reply.send(Registration { id, outbound: rx }).is_err() {
            debug!(connection = id, "Socket went away before registration completed");
            return;
        }

        self.connections.insert(id, conn);
        info!(connection = id, total = self.connections.len(), "Client connected");
    }

    async fn inbound(&mut self, id: ConnectionId, message: ClientMessage) {
        let reply = match message {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::StateRequest => ServerMessage::state(self.current_state().await),
        };

        let delivered = match self.connections.get(&id) {
            Some(conn) => conn.deliver(Outbound::Message(reply)),
            None => return,
        };
        if !delivered {
            self.close(id);
        }
    }

    fn publish(&mut self, state: PlaybackState) {
        let message = ServerMessage::state(Some(state));
        let mut failed = Vec::new();
        let mut delivered = 0usize;

        for (id, conn) in &self.connections {
            if conn.phase() != ConnectionPhase::Open {
                continue;
            }
            if conn.deliver(Outbound::Message(message.clone())) {
                delivered += 1;
            } else {
                failed.push(*id);
            }
        }

        for id in failed {
            debug!(connection = id, "Dropping connection after failed delivery");
            self.close(id);
        }
        debug!(delivered, "Published state update");
    }

    fn heartbeat(&mut self) {
        let mut expired = Vec::new();

        for (id, conn) in self.connections.iter_mut() {
            match conn.liveness.probe() {
                Probe::Expired => {
                    info!(connection = *id, "Heartbeat unanswered, closing connection");
                    expired.push(*id);
                }
                Probe::Send => {
                    if !conn.deliver(Outbound::Probe) {
                        expired.push(*id);
                    }
                }
            }
        }

        for id in expired {
            self.close(id);
        }
    }

    /// Close and forget a connection; its socket task sees `Close` or a dropped queue
    fn close(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if let Err(e) = conn.transition(ConnectionEvent::CloseRequested) {
            debug!(connection = id, "{}", e);
        }
        conn.deliver(Outbound::Close);
        if let Err(e) = conn.transition(ConnectionEvent::Closed) {
            debug!(connection = id, "{}", e);
        }
    }
}

// =============================================================================
// WebSocket transport
// =============================================================================

/// GET /ws - upgrade to the push channel
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

async fn serve_socket(socket: WebSocket, hub: BroadcastHub) {
    let Some(Registration { id, mut outbound }) = hub.register().await else {
        warn!("Hub unavailable, closing new connection");
        return;
    };
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let message = match frame {
                    Some(Outbound::Message(msg)) => match msg.to_json() {
                        Some(json) => Message::Text(json.into()),
                        None => continue,
                    },
                    Some(Outbound::Probe) => Message::Ping(Default::default()),
                    Some(Outbound::Close) | None => {
                        if let Err(e) = sender.send(Message::Close(None)).await {
                            debug!(connection = id, "Close frame not sent: {}", e);
                        }
                        break;
                    }
                };
                if let Err(e) = sender.send(message).await {
                    debug!(connection = id, "Send failed: {}", e);
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(message) => hub.inbound(id, message).await,
                        Err(e) => warn!(connection = id, "Unknown message: {}", e),
                    }
                }
                Some(Ok(Message::Pong(_))) => hub.pong(id).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = id, "WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    hub.disconnected(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EventKind, MediaMetadata, MemoryStateStore, PlayerInfo, StateStore};
    use std::sync::Arc;
    use tokio::time::timeout;

    fn song(title: &str) -> PlaybackState {
        let metadata = MediaMetadata {
            title: title.to_string(),
            ..Default::default()
        };
        PlaybackState::new(EventKind::Play, metadata, PlayerInfo::default(), 1)
    }

    fn quiet_config() -> HubConfig {
        // Timer heartbeats out of the way; tests drive them explicitly
        HubConfig {
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn start_hub(store: Arc<MemoryStateStore>) -> BroadcastHub {
        BroadcastHub::start(store, quiet_config(), CancellationToken::new())
    }

    async fn next(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn new_connection_receives_current_state() {
        let store = Arc::new(MemoryStateStore::new());
        store.save(&song("Already Playing")).await.unwrap();
        let hub = start_hub(store);

        let mut reg = hub.register().await.unwrap();
        assert_eq!(
            next(&mut reg.outbound).await,
            Outbound::Message(ServerMessage::state(Some(song("Already Playing"))))
        );

        let conns = hub.connections().await;
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].phase, ConnectionPhase::Open);
    }

    #[tokio::test]
    async fn empty_store_sends_nothing_on_open() {
        let hub = start_hub(Arc::new(MemoryStateStore::new()));
        let mut reg = hub.register().await.unwrap();

        hub.inbound(reg.id, ClientMessage::Ping).await;
        assert_eq!(next(&mut reg.outbound).await, Outbound::Message(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn state_request_without_state_gets_null() {
        let hub = start_hub(Arc::new(MemoryStateStore::new()));
        let mut reg = hub.register().await.unwrap();

        hub.inbound(reg.id, ClientMessage::StateRequest).await;
        assert_eq!(
            next(&mut reg.outbound).await,
            Outbound::Message(ServerMessage::state(None))
        );
    }

    #[tokio::test]
    async fn publish_reaches_every_open_connection_in_order() {
        let hub = start_hub(Arc::new(MemoryStateStore::new()));
        let mut a = hub.register().await.unwrap();
        let mut b = hub.register().await.unwrap();

        hub.publish(song("One")).await;
        hub.publish(song("Two")).await;

        for reg in [&mut a, &mut b] {
            assert_eq!(
                next(&mut reg.outbound).await,
                Outbound::Message(ServerMessage::state(Some(song("One"))))
            );
            assert_eq!(
                next(&mut reg.outbound).await,
                Outbound::Message(ServerMessage::state(Some(song("Two"))))
            );
        }
    }

    #[tokio::test]
    async fn unanswered_heartbeat_prunes_before_next_publish() {
        let hub = start_hub(Arc::new(MemoryStateStore::new()));
        let mut silent = hub.register().await.unwrap();
        let mut responsive = hub.register().await.unwrap();

        hub.heartbeat().await;
        assert_eq!(next(&mut silent.outbound).await, Outbound::Probe);
        assert_eq!(next(&mut responsive.outbound).await, Outbound::Probe);
        hub.pong(responsive.id).await;

        hub.heartbeat().await;
        assert_eq!(next(&mut silent.outbound).await, Outbound::Close);
        assert_eq!(next(&mut responsive.outbound).await, Outbound::Probe);

        let ids: Vec<_> = hub.connections().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![responsive.id]);

        hub.publish(song("After Prune")).await;
        assert_eq!(
            next(&mut responsive.outbound).await,
            Outbound::Message(ServerMessage::state(Some(song("After Prune"))))
        );
        assert!(
            silent.outbound.recv().await.is_none(),
            "pruned connection must not receive publishes"
        );
    }

    #[tokio::test]
    async fn dropped_receiver_is_removed_on_publish() {
        let hub = start_hub(Arc::new(MemoryStateStore::new()));
        let reg = hub.register().await.unwrap();
        drop(reg.outbound);

        hub.publish(song("Nobody Listening")).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_removes_connection() {
        let hub = start_hub(Arc::new(MemoryStateStore::new()));
        let reg = hub.register().await.unwrap();
        hub.disconnected(reg.id).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn timer_heartbeat_prunes_silent_peer() {
        let config = HubConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let hub = BroadcastHub::start(
            Arc::new(MemoryStateStore::new()),
            config,
            CancellationToken::new(),
        );
        let mut reg = hub.register().await.unwrap();

        assert_eq!(next(&mut reg.outbound).await, Outbound::Probe);
        assert_eq!(next(&mut reg.outbound).await, Outbound::Close);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let shutdown = CancellationToken::new();
        let hub = BroadcastHub::start(Arc::new(MemoryStateStore::new()), quiet_config(), shutdown.clone());
        let mut reg = hub.register().await.unwrap();

        shutdown.cancel();
        assert_eq!(next(&mut reg.outbound).await, Outbound::Close);
        assert!(hub.register().await.is_none());
    }
}
