//! Domain types shared between the daemon and the wire protocol
//!
//! Songs are sourced verbatim from the media catalog and never mutated;
//! fields the catalog sends beyond the ones we care about ride along in
//! `extra` and are passed back to clients untouched.

use serde::{Deserialize, Serialize};

/// A single song record as returned by the media catalog.
///
/// Identity is `id`. The named fields use the catalog's camelCase wire
/// names; everything else the catalog attaches (duration, coverArt,
/// suffix, ...) is preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Song {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(rename = "artistId", default, skip_serializing_if = "Option::is_none")]
    pub artist_id: Option<String>,
    #[serde(rename = "albumId", default, skip_serializing_if = "Option::is_none")]
    pub album_id: Option<String>,
    #[serde(rename = "discNumber", default, skip_serializing_if = "Option::is_none")]
    pub disc_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Song {
    /// Canonical ordering key: (artistId, albumId, discNumber, track).
    ///
    /// Returns None when any component is missing; a queue containing such
    /// a song keeps its resolver order instead of being sorted.
    pub fn sort_key(&self) -> Option<(&str, &str, u32, u32)> {
        Some((
            self.artist_id.as_deref()?,
            self.album_id.as_deref()?,
            self.disc_number?,
            self.track?,
        ))
    }
}

/// A bare catalog reference carried in queue-building requests.
///
/// Clients send whatever descriptive fields they have alongside the id
/// (name, artist, ...); only the id matters to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdRef {
    pub id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl IdRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// References to resolve into an ordered song list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueRefs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artist: Vec<IdRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub album: Vec<IdRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub song: Vec<IdRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub playlist: Vec<IdRef>,
}

impl QueueRefs {
    pub fn is_empty(&self) -> bool {
        self.artist.is_empty()
            && self.album.is_empty()
            && self.song.is_empty()
            && self.playlist.is_empty()
    }

    /// The canonical sort applies only to queues built purely from
    /// artist/album references; bare song or playlist references carry
    /// their own ordering.
    pub fn wants_sort(&self) -> bool {
        (!self.artist.is_empty() || !self.album.is_empty())
            && self.song.is_empty()
            && self.playlist.is_empty()
    }
}

/// Playback state enumeration
///
/// Owned by the playback controller; changes only via controller
/// operations or engine end-of-track signals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Paused,
    Playing,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "Stopped"),
            PlaybackState::Paused => write!(f, "Paused"),
            PlaybackState::Playing => write!(f, "Playing"),
        }
    }
}

/// Playback progress in whole seconds, as reported by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub percent: u32,
    /// Elapsed seconds
    pub time: u64,
    /// Track length in seconds
    pub length: u64,
}
