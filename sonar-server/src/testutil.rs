//! Shared test fixtures: an in-memory catalog backend and a scripted
//! playback engine.

use crate::backend::{Album, AlbumRef, Artist, AudioDownload, CatalogBackend, Playlist};
use crate::player::{AudioEngine, EnginePosition};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use sonar_common::error::{Error, Result};
use sonar_common::types::Song;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Build a song with full sort metadata.
pub fn make_song(id: &str, artist_id: &str, album_id: &str, disc: u32, track: u32) -> Song {
    Song {
        id: id.to_string(),
        title: format!("Title {id}"),
        artist: format!("Artist {artist_id}"),
        album: format!("Album {album_id}"),
        artist_id: Some(artist_id.to_string()),
        album_id: Some(album_id.to_string()),
        disc_number: Some(disc),
        track: Some(track),
        extra: serde_json::Map::new(),
    }
}

/// In-memory catalog with controllable download behavior.
#[derive(Default)]
pub struct StubCatalog {
    pub artists: HashMap<String, Artist>,
    pub albums: HashMap<String, Album>,
    pub songs: HashMap<String, Song>,
    pub playlists: HashMap<String, Playlist>,
    /// Audio bytes served by `stream`; songs default to 8 bytes of zeros.
    pub audio: HashMap<String, Vec<u8>>,
    /// Streams for these ids block until a permit is added to the gate.
    pub gates: HashMap<String, Arc<Semaphore>>,
    /// Streams for these ids fail after the first chunk.
    pub broken: HashSet<String>,
    pub downloads: AtomicUsize,
}

impl StubCatalog {
    pub fn with_songs(songs: Vec<Song>) -> Self {
        let mut stub = Self::default();
        for song in songs {
            stub.songs.insert(song.id.clone(), song);
        }
        stub
    }

    pub fn add_album(&mut self, id: &str, songs: Vec<Song>) {
        self.albums.insert(
            id.to_string(),
            Album {
                id: id.to_string(),
                name: format!("Album {id}"),
                songs,
            },
        );
    }

    pub fn add_artist(&mut self, id: &str, album_ids: &[&str]) {
        self.artists.insert(
            id.to_string(),
            Artist {
                id: id.to_string(),
                name: format!("Artist {id}"),
                albums: album_ids
                    .iter()
                    .map(|a| AlbumRef { id: a.to_string() })
                    .collect(),
            },
        );
    }

    pub fn add_playlist(&mut self, id: &str, entries: Vec<Song>) {
        self.playlists.insert(
            id.to_string(),
            Playlist {
                id: id.to_string(),
                name: format!("Playlist {id}"),
                entries,
            },
        );
    }

    pub fn set_audio(&mut self, id: &str, size: usize) {
        self.audio.insert(id.to_string(), vec![0u8; size]);
    }

    /// Make `stream(id)` block until `release` is called on the returned
    /// gate.
    pub fn gate(&mut self, id: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.insert(id.to_string(), Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl CatalogBackend for StubCatalog {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get_artist(&self, id: &str) -> Result<Artist> {
        self.artists
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NoSuchReference(id.to_string()))
    }

    async fn get_album(&self, id: &str) -> Result<Album> {
        self.albums
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NoSuchReference(id.to_string()))
    }

    async fn get_song(&self, id: &str) -> Result<Song> {
        self.songs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NoSuchReference(id.to_string()))
    }

    async fn get_playlist(&self, id: &str) -> Result<Playlist> {
        self.playlists
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NoSuchReference(id.to_string()))
    }

    async fn stream(&self, id: &str) -> Result<AudioDownload> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let data = self.audio.get(id).cloned().unwrap_or_else(|| vec![0u8; 8]);
        let gate = self.gates.get(id).cloned();

        if self.broken.contains(id) {
            let chunks: Vec<Result<Bytes>> = vec![
                Ok(Bytes::from(data)),
                Err(Error::Http("connection reset".into())),
            ];
            return Ok(AudioDownload {
                content_length: None,
                stream: futures::stream::iter(chunks).boxed(),
            });
        }

        let content_length = Some(data.len() as u64);
        let stream = futures::stream::once(async move {
            if let Some(gate) = gate {
                let permit = gate.acquire().await.expect("gate closed");
                permit.forget();
            }
            Ok(Bytes::from(data))
        })
        .boxed();

        Ok(AudioDownload {
            content_length,
            stream,
        })
    }
}

/// Scripted playback engine that records the calls it receives.
pub struct StubEngine {
    pub loaded: Mutex<Vec<PathBuf>>,
    pub seeks: Mutex<Vec<f64>>,
    pub position: Mutex<Option<EnginePosition>>,
    pub fail_load: AtomicBool,
    /// Counts every load call, including the ones `fail_load` rejects
    pub load_attempts: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self {
            loaded: Mutex::new(Vec::new()),
            seeks: Mutex::new(Vec::new()),
            position: Mutex::new(None),
            fail_load: AtomicBool::new(false),
            load_attempts: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }
}

impl StubEngine {
    pub fn set_position(&self, time: f64, length: f64) {
        let percent = if length > 0.0 {
            ((time / length) * 100.0) as u32
        } else {
            0
        };
        *self.position.lock().unwrap() = Some(EnginePosition {
            time,
            length,
            percent,
        });
    }

    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.loaded.lock().unwrap().clone()
    }
}

/// Boxable delegate so tests can keep an `Arc<StubEngine>` for inspection
/// while the controller owns its engine.
pub struct SharedEngine(pub Arc<StubEngine>);

#[async_trait]
impl AudioEngine for SharedEngine {
    async fn load(&self, path: &Path) -> Result<()> {
        self.0.load(path).await
    }

    async fn pause(&self) -> Result<()> {
        self.0.pause().await
    }

    async fn resume(&self) -> Result<()> {
        self.0.resume().await
    }

    async fn stop(&self) -> Result<()> {
        self.0.stop().await
    }

    async fn seek_to(&self, seconds: f64) -> Result<()> {
        self.0.seek_to(seconds).await
    }

    async fn position(&self) -> Option<EnginePosition> {
        self.0.position().await
    }
}

#[async_trait]
impl AudioEngine for StubEngine {
    async fn load(&self, path: &Path) -> Result<()> {
        self.load_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(Error::Playback(format!(
                "could not load {}",
                path.display()
            )));
        }
        self.loaded.lock().unwrap().push(path.to_path_buf());
        self.set_position(0.0, 240.0);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        *self.position.lock().unwrap() = None;
        Ok(())
    }

    async fn seek_to(&self, seconds: f64) -> Result<()> {
        self.seeks.lock().unwrap().push(seconds);
        if let Some(pos) = self.position.lock().unwrap().as_mut() {
            pos.time = seconds;
        }
        Ok(())
    }

    async fn position(&self) -> Option<EnginePosition> {
        *self.position.lock().unwrap()
    }
}
