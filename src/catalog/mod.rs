//! Track catalog - the collaborator the player asks for tracks and queue order
//!
//! The player never owns track metadata. It asks a [`Catalog`] for a track by
//! id when a play command arrives, and for the next track in the queue when a
//! skip command arrives. Tracks are immutable once handed out.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Catalog track identifier
pub type TrackId = u64;

/// A playable track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    /// Duration in seconds (0 when unknown)
    #[serde(default)]
    pub duration: f64,
    /// Where the decode stage reads the media from
    #[serde(alias = "file_path", alias = "filepath")]
    pub storage_location: PathBuf,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("track not found: {0}")]
    NotFound(TrackId),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of the track store and its play queue
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Look up a track by id
    async fn get_track(&self, id: TrackId) -> Result<Track, CatalogError>;

    /// The track queued after `after`, or None when the queue is exhausted
    async fn next_in_queue(&self, after: TrackId) -> Result<Option<Track>, CatalogError>;
}

/// Shared catalog handle
pub type SharedCatalog = Arc<dyn Catalog>;

/// Catalog backed by an ordered list; queue order is list order.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tracks: RwLock<Vec<Track>>,
}

impl InMemoryCatalog {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            tracks: RwLock::new(tracks),
        }
    }

    /// Append a track to the end of the queue
    pub async fn push(&self, track: Track) {
        self.tracks.write().await.push(track);
    }

    pub async fn len(&self) -> usize {
        self.tracks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tracks.read().await.is_empty()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_track(&self, id: TrackId) -> Result<Track, CatalogError> {
        self.tracks
            .read()
            .await
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(CatalogError::NotFound(id))
    }

    async fn next_in_queue(&self, after: TrackId) -> Result<Option<Track>, CatalogError> {
        let tracks = self.tracks.read().await;
        let next = tracks
            .iter()
            .position(|t| t.id == after)
            .and_then(|pos| tracks.get(pos + 1))
            .cloned();
        debug!(after, next = ?next.as_ref().map(|t| t.id), "Queue lookup");
        Ok(next)
    }
}

/// On-disk library format
#[derive(Debug, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    tracks: Vec<Track>,
}

/// Load the track library from a JSON file.
///
/// Relative storage locations are resolved against `media_dir`, the same
/// directory assembled uploads land in. A missing library file yields an
/// empty catalog.
pub fn load_library(path: &Path, media_dir: &Path) -> Result<InMemoryCatalog> {
    if !path.exists() {
        info!("No library file at {}, starting with an empty catalog", path.display());
        return Ok(InMemoryCatalog::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read library {}", path.display()))?;
    let library: LibraryFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse library {}", path.display()))?;

    let tracks: Vec<Track> = library
        .tracks
        .into_iter()
        .map(|mut track| {
            if track.storage_location.is_relative() {
                track.storage_location = media_dir.join(&track.storage_location);
            }
            track
        })
        .collect();

    info!("Loaded {} tracks from {}", tracks.len(), path.display());
    Ok(InMemoryCatalog::new(tracks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: TrackId) -> Track {
        Track {
            id,
            title: format!("Track {}", id),
            artist: "Artist".to_string(),
            duration: 180.0,
            storage_location: PathBuf::from(format!("/media/{}.mp3", id)),
        }
    }

    #[tokio::test]
    async fn get_track_returns_not_found_for_unknown_id() {
        let catalog = InMemoryCatalog::new(vec![track(1)]);
        assert_eq!(catalog.get_track(1).await.unwrap().id, 1);
        assert!(matches!(
            catalog.get_track(9).await,
            Err(CatalogError::NotFound(9))
        ));
    }

    #[tokio::test]
    async fn next_in_queue_follows_list_order() {
        let catalog = InMemoryCatalog::new(vec![track(5), track(2), track(7)]);
        assert_eq!(catalog.next_in_queue(5).await.unwrap().unwrap().id, 2);
        assert_eq!(catalog.next_in_queue(2).await.unwrap().unwrap().id, 7);
        assert!(catalog.next_in_queue(7).await.unwrap().is_none());
        // Unknown anchor has no successor
        assert!(catalog.next_in_queue(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_extends_the_queue() {
        let catalog = InMemoryCatalog::new(vec![track(1)]);
        assert!(catalog.next_in_queue(1).await.unwrap().is_none());
        catalog.push(track(2)).await;
        assert_eq!(catalog.len().await, 2);
        assert_eq!(catalog.next_in_queue(1).await.unwrap().unwrap().id, 2);
    }

    #[test]
    fn load_library_resolves_relative_locations() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("library.json");
        std::fs::write(
            &library,
            r#"{"tracks": [
                {"id": 1, "title": "One", "artist": "A", "duration": 12.5, "file_path": "one.mp3"},
                {"id": 2, "title": "Two", "storage_location": "/abs/two.flac"}
            ]}"#,
        )
        .unwrap();

        let media = dir.path().join("media");
        let catalog = load_library(&library, &media).unwrap();
        let (one, two) = tokio_test::block_on(async {
            (
                catalog.get_track(1).await.unwrap(),
                catalog.get_track(2).await.unwrap(),
            )
        });

        assert_eq!(one.storage_location, media.join("one.mp3"));
        assert_eq!(one.duration, 12.5);
        assert_eq!(two.storage_location, PathBuf::from("/abs/two.flac"));
        assert_eq!(two.artist, "");
    }

    #[test]
    fn load_library_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = load_library(&dir.path().join("nope.json"), dir.path()).unwrap();
        assert!(tokio_test::block_on(catalog.is_empty()));
    }

    #[test]
    fn load_library_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("library.json");
        std::fs::write(&library, "{ not json").unwrap();
        assert!(load_library(&library, dir.path()).is_err());
    }
}
