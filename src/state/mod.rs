//! Canonical playback state
//!
//! `PlaybackState` is the single "what is playing right now" snapshot that the
//! gateway derives from an authorized webhook, the store persists, and the hub
//! pushes to displays. Field names on the wire are camelCase so display clients
//! can consume the JSON unchanged.

pub mod store;

pub use store::{FileStateStore, MemoryStateStore, SharedStore, StateStore, StoreError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Webhook event kinds that affect the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "media.play")]
    Play,
    #[serde(rename = "media.pause")]
    Pause,
    #[serde(rename = "media.resume")]
    Resume,
    #[serde(rename = "media.stop")]
    Stop,
}

impl EventKind {
    /// Parse the Plex event name; other Plex events (scrobble, rate, library.*) yield None
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "media.play" => Some(Self::Play),
            "media.pause" => Some(Self::Pause),
            "media.resume" => Some(Self::Resume),
            "media.stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "media.play",
            Self::Pause => "media.pause",
            Self::Resume => "media.resume",
            Self::Stop => "media.stop",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media descriptor, mirroring the `Metadata` object of a Plex webhook.
///
/// Every field is optional on input: absent or null strings default to empty
/// and numbers to 0, and numbers sent as floats or strings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaMetadata {
    #[serde(deserialize_with = "lenient::or_default")]
    pub library_section_type: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub rating_key: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub key: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub parent_rating_key: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub grandparent_rating_key: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub guid: String,
    #[serde(rename = "librarySectionID", deserialize_with = "lenient::int")]
    pub library_section_id: i64,
    #[serde(rename = "type", deserialize_with = "lenient::or_default")]
    pub media_type: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub title: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub grandparent_key: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub parent_key: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub grandparent_title: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub parent_title: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub summary: String,
    #[serde(deserialize_with = "lenient::int")]
    pub index: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub parent_index: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub rating_count: i64,
    #[serde(deserialize_with = "lenient::or_default")]
    pub thumb: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub art: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub parent_thumb: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub grandparent_thumb: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub grandparent_art: String,
    #[serde(deserialize_with = "lenient::int")]
    pub added_at: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub updated_at: i64,
    #[serde(
        deserialize_with = "lenient::opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_year: Option<i64>,
    #[serde(
        deserialize_with = "lenient::opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub year: Option<i64>,
}

impl MediaMetadata {
    /// Best artwork reference for display: album/season thumb first, then own thumb
    pub fn artwork(&self) -> Option<&str> {
        [&self.parent_thumb, &self.thumb, &self.grandparent_thumb]
            .into_iter()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }
}

/// Player descriptor, mirroring the `Player` object of a Plex webhook
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerInfo {
    #[serde(deserialize_with = "lenient::or_default")]
    pub local: bool,
    #[serde(deserialize_with = "lenient::or_default")]
    pub public_address: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub title: String,
    #[serde(deserialize_with = "lenient::or_default")]
    pub uuid: String,
}

/// The current playback snapshot.
///
/// `is_paused` is always derived from `event`; it cannot be set independently,
/// and a persisted value is re-derived when read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredPlaybackState")]
pub struct PlaybackState {
    pub event: EventKind,
    pub metadata: MediaMetadata,
    pub player: PlayerInfo,
    /// Ingest time, Unix milliseconds
    pub timestamp: i64,
    is_paused: bool,
}

impl PlaybackState {
    pub fn new(event: EventKind, metadata: MediaMetadata, player: PlayerInfo, timestamp: i64) -> Self {
        Self {
            event,
            metadata,
            player,
            timestamp,
            is_paused: event == EventKind::Pause,
        }
    }

    /// Build a state stamped with the current wall-clock time
    pub fn now(event: EventKind, metadata: MediaMetadata, player: PlayerInfo) -> Self {
        Self::new(event, metadata, player, chrono::Utc::now().timestamp_millis())
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPlaybackState {
    event: EventKind,
    #[serde(default)]
    metadata: MediaMetadata,
    #[serde(default)]
    player: PlayerInfo,
    #[serde(default, deserialize_with = "lenient::int")]
    timestamp: i64,
}

impl From<StoredPlaybackState> for PlaybackState {
    fn from(raw: StoredPlaybackState) -> Self {
        PlaybackState::new(raw.event, raw.metadata, raw.player, raw.timestamp)
    }
}

/// Lenient deserializers for fields Plex sends inconsistently
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};

    /// `null` reads as the type's default, like an absent key
    pub fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Default,
    {
        Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
    }
    use serde_json::Value;

    fn coerce(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(coerce(&value).unwrap_or(0))
    }

    pub fn opt_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(coerce(&value))
    }
}
