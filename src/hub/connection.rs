//! Per-connection state tracked by the hub loop
//!
//! A connection moves `Connecting → Open → Closing → Closed`. Transitions are
//! explicit so the hub's bookkeeping can be tested without a socket.

use std::fmt;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Initial state delivered, connection accepts publishes
    Opened,
    /// Hub decided to close (heartbeat timeout, send failure)
    CloseRequested,
    /// Transport is gone
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectionPhase,
    pub event: ConnectionEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid connection transition {:?} on {:?}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

impl ConnectionPhase {
    pub fn apply(self, event: ConnectionEvent) -> Result<ConnectionPhase, InvalidTransition> {
        use ConnectionEvent as E;
        use ConnectionPhase as P;

        match (self, event) {
            (P::Connecting, E::Opened) => Ok(P::Open),
            (P::Connecting | P::Open, E::CloseRequested) => Ok(P::Closing),
            (P::Connecting | P::Open | P::Closing, E::Closed) => Ok(P::Closed),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

/// Result of a heartbeat probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Peer answered the previous probe; a new one should be sent
    Send,
    /// Previous probe went unanswered
    Expired,
}

/// Liveness bookkeeping: one outstanding probe at a time
#[derive(Debug, Clone)]
pub struct Liveness {
    alive: bool,
    last_pong: Instant,
}

impl Liveness {
    pub fn new(now: Instant) -> Self {
        Self {
            alive: true,
            last_pong: now,
        }
    }

    pub fn probe(&mut self) -> Probe {
        if !self.alive {
            return Probe::Expired;
        }
        self.alive = false;
        Probe::Send
    }

    pub fn pong(&mut self, now: Instant) {
        self.alive = true;
        self.last_pong = now;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn last_pong(&self) -> Instant {
        self.last_pong
    }
}

/// Frames the hub loop hands to a connection's socket task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Transport-level liveness probe (WebSocket ping)
    Probe,
    Close,
}

pub(crate) struct Connection {
    phase: ConnectionPhase,
    pub(crate) liveness: Liveness,
    outbound: mpsc::Sender<Outbound>,
}

impl Connection {
    pub(crate) fn new(outbound: mpsc::Sender<Outbound>, now: Instant) -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            liveness: Liveness::new(now),
            outbound,
        }
    }

    pub(crate) fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub(crate) fn transition(&mut self, event: ConnectionEvent) -> Result<(), InvalidTransition> {
        self.phase = self.phase.apply(event)?;
        Ok(())
    }

    /// Best-effort enqueue; false when the socket task is gone or backed up
    pub(crate) fn deliver(&self, frame: Outbound) -> bool {
        self.outbound.try_send(frame).is_ok()
    }
}
