//! Artwork proxy with an on-disk cache
//!
//! Displays ask for `/api/image?thumb=...`; the relay turns the Plex thumb
//! reference into a transcode URL, serves a cached copy when one is fresh,
//! and otherwise downloads and stores it under `{data}/image-cache/`.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::AppState;

const CACHE_SUBDIR: &str = "image-cache";
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_DIMENSION: u32 = 1200;

#[derive(Debug, Error)]
enum ArtworkError {
    #[error("artwork request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("artwork cache I/O failed: {0}")]
    Io(#[from] io::Error),
}

pub struct ArtworkCache {
    dir: PathBuf,
    http: reqwest::Client,
    max_age: Duration,
    max_bytes: u64,
}

impl ArtworkCache {
    pub fn new(data_dir: &Path, http: reqwest::Client) -> Self {
        Self {
            dir: data_dir.join(CACHE_SUBDIR),
            http,
            max_age: DEFAULT_MAX_AGE,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_limits(mut self, max_age: Duration, max_bytes: u64) -> Self {
        self.max_age = max_age;
        self.max_bytes = max_bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{:x}.jpg", md5::compute(url.as_bytes())))
    }

    /// Image bytes for `url`, from cache or network; None on any failure
    pub async fn fetch(&self, url: &str) -> Option<Vec<u8>> {
        let path = self.cache_path(url);

        if let Some(bytes) = self.read_fresh(&path).await {
            debug!("Artwork cache hit: {}", path.display());
            return Some(bytes);
        }

        let bytes = match self.download(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to fetch artwork: {}", e);
                return None;
            }
        };

        if let Err(e) = self.store(&path, &bytes).await {
            warn!("Failed to cache artwork: {}", e);
        }
        Some(bytes)
    }

    async fn read_fresh(&self, path: &Path) -> Option<Vec<u8>> {
        let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();

        if age >= self.max_age {
            debug!("Artwork cache entry expired: {}", path.display());
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!("Failed to remove expired artwork: {}", e);
            }
            return None;
        }

        tokio::fs::read(path).await.ok()
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ArtworkError> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn store(&self, path: &Path, bytes: &[u8]) -> Result<(), ArtworkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(path, bytes).await?;
        let removed = self.evict().await?;
        if removed > 0 {
            info!("Evicted {} artwork cache file(s)", removed);
        }
        Ok(())
    }

    /// When the cache exceeds its size limit, delete oldest files until it is
    /// at 80% of the limit. Returns the number of files removed.
    pub async fn evict(&self) -> io::Result<usize> {
        let mut entries = Vec::new();
        let mut total: u64 = 0;

        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            total += meta.len();
            entries.push((modified, meta.len(), entry.path()));
        }

        if total <= self.max_bytes {
            return Ok(0);
        }

        let target = self.max_bytes / 5 * 4;
        entries.sort_by_key(|(modified, _, _)| *modified);

        let mut removed = 0;
        for (_, size, path) in entries {
            if total <= target {
                break;
            }
            tokio::fs::remove_file(&path).await?;
            total = total.saturating_sub(size);
            removed += 1;
        }
        Ok(removed)
    }
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub thumb: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// GET /api/image - proxied, cached artwork
pub async fn image_handler(
    State(state): State<AppState>,
    Query(params): Query<ImageQuery>,
) -> Response {
    let Some(thumb) = params.thumb.filter(|t| !t.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Missing thumb parameter"})),
        )
            .into_response();
    };

    let width = params.width.unwrap_or(DEFAULT_DIMENSION);
    let height = params.height.unwrap_or(DEFAULT_DIMENSION);

    let image = match state.plex.artwork_url(&thumb, width, height) {
        Some(url) => state.artwork.fetch(&url).await,
        None => None,
    };

    match image {
        Some(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Image not found"})),
        )
            .into_response(),
    }
}
