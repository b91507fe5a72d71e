//! Single-slot state store
//!
//! Holds exactly one current `PlaybackState`. The file-backed store writes the
//! whole value to a sibling temp file and renames it into place, so readers
//! never observe a half-written state, and a restart picks up the last save.

use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use super::PlaybackState;

const STATE_FILE: &str = "current-state.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode playback state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("state file {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Storage for the one current playback state.
///
/// Implementations must be safe to call concurrently without callers
/// coordinating: `save` replaces the whole value atomically, `load` on an
/// empty store returns `Ok(None)`, and `clear` on an empty store is a no-op.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &PlaybackState) -> Result<(), StoreError>;

    async fn load(&self) -> Result<Option<PlaybackState>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn StateStore>;

/// JSON file store at `{data_dir}/current-state.json`
pub struct FileStateStore {
    path: PathBuf,
    // Serializes writers and readers so a clear can't race a rename
    io_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(STATE_FILE),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn write_atomic(&self, json: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(parent, e))?;
        }
        let tmp = self.temp_path();
        fs::write(&tmp, json).map_err(|e| self.io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(&self.path, e))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, state: &PlaybackState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state).map_err(StoreError::Encode)?;
        let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_atomic(&json)?;
        tracing::debug!(event = %state.event, "Saved playback state to {}", self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Option<PlaybackState>, StoreError> {
        let content = {
            let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
            match fs::read_to_string(&self.path) {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(self.io_err(&self.path, e)),
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("Cleared playback state");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(&self.path, e)),
        }
    }
}

/// In-memory store (tests, ephemeral runs)
#[derive(Default)]
pub struct MemoryStateStore {
    slot: RwLock<Option<PlaybackState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, state: &PlaybackState) -> Result<(), StoreError> {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<PlaybackState>, StoreError> {
        Ok(self.slot.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
