//! Transport-free reconnection state machine
//!
//! The driver feeds it connection events and server messages; it decides the
//! status, the next backoff delay, and whether a state update is new enough
//! to reach the rendering layer.

use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::PlaybackState;

/// Reconnect delays indexed by attempt, clamped to the last entry
pub const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Transport failed; a reconnect is still coming
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientMachine {
    schedule: Vec<Duration>,
    status: ConnectionStatus,
    attempts: u32,
    applied: Option<PlaybackState>,
}

impl Default for ClientMachine {
    fn default() -> Self {
        Self::new(BACKOFF_SCHEDULE.to_vec())
    }
}

impl ClientMachine {
    /// An empty schedule falls back to the default one
    pub fn new(schedule: Vec<Duration>) -> Self {
        let schedule = if schedule.is_empty() {
            BACKOFF_SCHEDULE.to_vec()
        } else {
            schedule
        };
        Self {
            schedule,
            status: ConnectionStatus::Connecting,
            attempts: 0,
            applied: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Last state handed to the rendering layer
    pub fn current(&self) -> Option<&PlaybackState> {
        self.applied.as_ref()
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let last = self.schedule.len() - 1;
        self.schedule[(attempt as usize).min(last)]
    }

    pub fn begin_connect(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    /// Transport is up: reset the backoff and return the first message to send
    pub fn on_connected(&mut self) -> ClientMessage {
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        ClientMessage::StateRequest
    }

    /// Returns true when the rendering layer should be notified
    pub fn on_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::StateUpdate { data } => {
                if data == self.applied {
                    debug!("Ignoring unchanged state update");
                    return false;
                }
                self.applied = data;
                true
            }
            ServerMessage::Pong => false,
        }
    }

    pub fn on_error(&mut self) {
        self.status = ConnectionStatus::Error;
    }

    /// Transport is gone: returns the delay before the next attempt
    pub fn on_closed(&mut self) -> Duration {
        self.status = ConnectionStatus::Disconnected;
        let delay = self.backoff(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }
}
