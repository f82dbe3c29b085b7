//! Media catalog backend adapter
//!
//! Talks to a Subsonic-compatible REST server and normalizes its JSON
//! quirks (single items delivered as bare objects instead of one-element
//! lists) in one place, so the rest of the daemon only ever sees typed
//! records.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use sonar_common::error::{Error, Result};
use sonar_common::types::Song;
use tracing::debug;

const API_VERSION: &str = "1.16.1";
const CLIENT_NAME: &str = "sonar";

/// Byte stream of a song download plus the expected size when the backend
/// reports one.
pub struct AudioDownload {
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// An artist record with its album references.
#[derive(Debug, Clone, Deserialize)]
pub struct Artist {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "album", default, deserialize_with = "one_or_many")]
    pub albums: Vec<AlbumRef>,
}

/// A bare album reference as listed under an artist.
#[derive(Debug, Clone, Deserialize)]
pub struct AlbumRef {
    pub id: String,
}

/// An album record with its songs in backend order.
#[derive(Debug, Clone, Deserialize)]
pub struct Album {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "song", default, deserialize_with = "one_or_many")]
    pub songs: Vec<Song>,
}

/// A playlist record with its entries in playlist order.
#[derive(Debug, Clone, Deserialize)]
pub struct Playlist {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "entry", default, deserialize_with = "one_or_many")]
    pub entries: Vec<Song>,
}

/// The remote media catalog.
///
/// Implementations resolve catalog ids into records and stream raw audio
/// bytes; the daemon treats the service as a black box behind this trait.
#[async_trait]
pub trait CatalogBackend: Send + Sync {
    /// Startup reachability check; failure here is fatal.
    async fn ping(&self) -> Result<()>;

    async fn get_artist(&self, id: &str) -> Result<Artist>;
    async fn get_album(&self, id: &str) -> Result<Album>;
    async fn get_song(&self, id: &str) -> Result<Song>;
    async fn get_playlist(&self, id: &str) -> Result<Playlist>;

    /// Open a byte stream for the song's audio data.
    async fn stream(&self, id: &str) -> Result<AudioDownload>;
}

/// Accept a list, a single bare object, or nothing at all.
///
/// Subsonic servers deliver one-element collections as plain objects; an
/// artist with a single album or an album with a single song would
/// otherwise fail to parse.
fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(serde::de::Error::custom))
            .collect(),
        single => Ok(vec![
            serde_json::from_value(single).map_err(serde::de::Error::custom)?
        ]),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "subsonic-response")]
    body: ApiResponse,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    error: Option<ApiError>,
    #[serde(default)]
    artist: Option<Artist>,
    #[serde(default)]
    album: Option<Album>,
    #[serde(default)]
    song: Option<Song>,
    #[serde(default)]
    playlist: Option<Playlist>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    message: String,
}

impl ApiResponse {
    fn failure_message(&self) -> Option<String> {
        if self.status == "ok" {
            return None;
        }
        Some(match &self.error {
            Some(e) => format!("{} (code {})", e.message, e.code),
            None => format!("backend status {}", self.status),
        })
    }
}

/// Subsonic REST API client.
pub struct SubsonicBackend {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl SubsonicBackend {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    fn endpoint(&self, view: &str) -> String {
        format!("{}/rest/{}.view", self.base_url, view)
    }

    fn auth_params(&self) -> [(&'static str, &str); 5] {
        [
            ("u", self.username.as_str()),
            ("p", self.password.as_str()),
            ("v", API_VERSION),
            ("c", CLIENT_NAME),
            ("f", "json"),
        ]
    }

    async fn call(&self, view: &str, id: Option<&str>) -> Result<ApiResponse> {
        debug!("Backend call: {} id={:?}", view, id);
        let mut request = self.client.get(self.endpoint(view)).query(&self.auth_params());
        if let Some(id) = id {
            request = request.query(&[("id", id)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Http(e.to_string()))?;

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("{view}: {e}")))?;
        Ok(envelope.body)
    }

    /// Run a lookup and extract one payload field, mapping failures to a
    /// skippable per-id error.
    async fn lookup<T>(
        &self,
        view: &str,
        id: &str,
        extract: impl FnOnce(ApiResponse) -> Option<T>,
    ) -> Result<T> {
        let body = self.call(view, Some(id)).await?;
        if let Some(message) = body.failure_message() {
            return Err(Error::NoSuchReference(format!("{id}: {message}")));
        }
        extract(body).ok_or_else(|| Error::NoSuchReference(id.to_string()))
    }
}

#[async_trait]
impl CatalogBackend for SubsonicBackend {
    async fn ping(&self) -> Result<()> {
        let body = self.call("ping", None).await?;
        match body.failure_message() {
            Some(message) => Err(Error::Http(message)),
            None => Ok(()),
        }
    }

    async fn get_artist(&self, id: &str) -> Result<Artist> {
        self.lookup("getArtist", id, |body| body.artist).await
    }

    async fn get_album(&self, id: &str) -> Result<Album> {
        self.lookup("getAlbum", id, |body| body.album).await
    }

    async fn get_song(&self, id: &str) -> Result<Song> {
        self.lookup("getSong", id, |body| body.song).await
    }

    async fn get_playlist(&self, id: &str) -> Result<Playlist> {
        self.lookup("getPlaylist", id, |body| body.playlist).await
    }

    async fn stream(&self, id: &str) -> Result<AudioDownload> {
        debug!("Backend stream: {}", id);
        let response = self
            .client
            .get(self.endpoint("stream"))
            .query(&self.auth_params())
            .query(&[("id", id)])
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Http(e.to_string()))?;

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Http(e.to_string())))
            .boxed();

        Ok(AudioDownload {
            content_length,
            stream,
        })
    }
}
