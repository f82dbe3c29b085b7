//! Catalog reference resolution
//!
//! Turns artist/album/song/playlist references into an ordered song list.
//! A lookup failure for a single id is never fatal to the whole build: the
//! id is logged and skipped so one stale reference can't sink an otherwise
//! valid queue.

use crate::backend::CatalogBackend;
use sonar_common::types::{QueueRefs, Song};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves queue references against the media catalog.
#[derive(Clone)]
pub struct Resolver {
    backend: Arc<dyn CatalogBackend>,
}

impl Resolver {
    pub fn new(backend: Arc<dyn CatalogBackend>) -> Self {
        Self { backend }
    }

    /// Resolve references into songs.
    ///
    /// Category order: songs of the artists' albums, then explicit albums'
    /// songs, then bare songs, then playlist entries; within each category
    /// the backend's own ordering is preserved.
    pub async fn resolve(&self, refs: &QueueRefs) -> Vec<Song> {
        let mut album_ids: Vec<String> = Vec::new();

        for artist_ref in &refs.artist {
            match self.backend.get_artist(&artist_ref.id).await {
                Ok(artist) => {
                    album_ids.extend(artist.albums.into_iter().map(|album| album.id));
                }
                Err(e) => warn!("Could not find artist {}: {}", artist_ref.id, e),
            }
        }
        album_ids.extend(refs.album.iter().map(|album_ref| album_ref.id.clone()));

        let mut songs: Vec<Song> = Vec::new();

        for album_id in &album_ids {
            match self.backend.get_album(album_id).await {
                Ok(album) => songs.extend(album.songs),
                Err(e) => warn!("Could not find album {}: {}", album_id, e),
            }
        }

        for song_ref in &refs.song {
            match self.backend.get_song(&song_ref.id).await {
                Ok(song) => songs.push(song),
                Err(e) => warn!("Could not find song {}: {}", song_ref.id, e),
            }
        }

        for playlist_ref in &refs.playlist {
            match self.backend.get_playlist(&playlist_ref.id).await {
                Ok(playlist) => songs.extend(playlist.entries),
                Err(e) => warn!("Could not find playlist {}: {}", playlist_ref.id, e),
            }
        }

        debug!("Resolved {} songs from references", songs.len());
        songs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_song, StubCatalog};
    use sonar_common::types::IdRef;

    fn refs(artist: &[&str], album: &[&str], song: &[&str], playlist: &[&str]) -> QueueRefs {
        QueueRefs {
            artist: artist.iter().map(|id| IdRef::new(*id)).collect(),
            album: album.iter().map(|id| IdRef::new(*id)).collect(),
            song: song.iter().map(|id| IdRef::new(*id)).collect(),
            playlist: playlist.iter().map(|id| IdRef::new(*id)).collect(),
        }
    }

    fn ids(songs: &[Song]) -> Vec<&str> {
        songs.iter().map(|s| s.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_category_ordering() {
        let mut stub = StubCatalog::default();
        stub.add_album("al1", vec![make_song("s1", "ar1", "al1", 1, 1)]);
        stub.add_album("al2", vec![make_song("s2", "ar2", "al2", 1, 1)]);
        stub.add_artist("ar1", &["al1"]);
        stub.songs
            .insert("s3".into(), make_song("s3", "ar3", "al3", 1, 1));
        stub.add_playlist("pl1", vec![make_song("s4", "ar4", "al4", 1, 1)]);

        let resolver = Resolver::new(Arc::new(stub));
        // Artist ar1 resolves to al1's songs first, then the explicit album
        // al2, then the bare song, then the playlist.
        let songs = resolver
            .resolve(&refs(&["ar1"], &["al2"], &["s3"], &["pl1"]))
            .await;
        assert_eq!(ids(&songs), vec!["s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_skipped() {
        let mut stub = StubCatalog::default();
        stub.add_album("al1", vec![make_song("s1", "ar1", "al1", 1, 1)]);

        let resolver = Resolver::new(Arc::new(stub));
        let songs = resolver
            .resolve(&refs(&["missing"], &["al1", "gone"], &["nope"], &[]))
            .await;
        assert_eq!(ids(&songs), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_album_order_within_artist() {
        let mut stub = StubCatalog::default();
        stub.add_album("al1", vec![make_song("s1", "ar1", "al1", 1, 1)]);
        stub.add_album(
            "al2",
            vec![
                make_song("s2", "ar1", "al2", 1, 1),
                make_song("s3", "ar1", "al2", 1, 2),
            ],
        );
        stub.add_artist("ar1", &["al2", "al1"]);

        let resolver = Resolver::new(Arc::new(stub));
        let songs = resolver.resolve(&refs(&["ar1"], &[], &[], &[])).await;
        // Backend album order (al2 before al1) is preserved.
        assert_eq!(ids(&songs), vec!["s2", "s3", "s1"]);
    }

    #[tokio::test]
    async fn test_empty_refs_resolve_to_nothing() {
        let resolver = Resolver::new(Arc::new(StubCatalog::default()));
        let songs = resolver.resolve(&QueueRefs::default()).await;
        assert!(songs.is_empty());
    }
}
