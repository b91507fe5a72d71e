//! Push-channel wire messages shared by the hub and the display client
//!
//! Server → client: `{"type":"state-update","data":{…}|null}`, `{"type":"pong"}`
//! Client → server: `{"type":"ping"}`, `{"type":"state-request"}`

use serde::{Deserialize, Serialize};

use crate::state::PlaybackState;

/// Path the hub is mounted at
pub const PUSH_PATH: &str = "/ws";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    StateUpdate {
        #[serde(default)]
        data: Option<PlaybackState>,
    },
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Ping,
    StateRequest,
}

impl ServerMessage {
    pub fn state(data: Option<PlaybackState>) -> Self {
        Self::StateUpdate { data }
    }

    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("Failed to encode server message: {}", e);
                None
            }
        }
    }
}

impl ClientMessage {
    pub fn to_json(self) -> String {
        match self {
            Self::Ping => r#"{"type":"ping"}"#.to_string(),
            Self::StateRequest => r#"{"type":"state-request"}"#.to_string(),
        }
    }
}
