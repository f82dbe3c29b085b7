//! Integration tests for the TCP control protocol
//!
//! Spin up a real server on an ephemeral port with a stubbed catalog and
//! playback engine, then drive it the way the command-line client does:
//! one connection, one JSON request, one JSON response.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use sonar_common::error::{Error, Result};
use sonar_common::types::Song;
use sonar_server::backend::{
    Album, AlbumRef, Artist, AudioDownload, CatalogBackend, Playlist,
};
use sonar_server::cache::CacheManager;
use sonar_server::player::{AudioEngine, EnginePosition, PlayerController};
use sonar_server::resolver::Resolver;
use sonar_server::server::ProtocolServer;
use sonar_server::session::Session;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Catalog fixture: one artist with one three-song album.
struct TestCatalog {
    artists: HashMap<String, Artist>,
    albums: HashMap<String, Album>,
    songs: HashMap<String, Song>,
}

fn make_song(id: &str, track: u32) -> Song {
    serde_json::from_value(json!({
        "id": id,
        "title": format!("Title {id}"),
        "artist": "Artist ar1",
        "album": "Album al1",
        "artistId": "ar1",
        "albumId": "al1",
        "discNumber": 1,
        "track": track,
    }))
    .unwrap()
}

impl TestCatalog {
    fn new() -> Self {
        // Tracks registered out of order so the canonical sort is visible.
        let songs: Vec<Song> = vec![
            make_song("s2", 3),
            make_song("s0", 1),
            make_song("s1", 2),
        ];
        let mut catalog = Self {
            artists: HashMap::new(),
            albums: HashMap::new(),
            songs: songs.iter().map(|s| (s.id.clone(), s.clone())).collect(),
        };
        catalog.albums.insert(
            "al1".into(),
            Album {
                id: "al1".into(),
                name: "Album al1".into(),
                songs,
            },
        );
        catalog.artists.insert(
            "ar1".into(),
            Artist {
                id: "ar1".into(),
                name: "Artist ar1".into(),
                albums: vec![AlbumRef { id: "al1".into() }],
            },
        );
        catalog
    }
}

#[async_trait]
impl CatalogBackend for TestCatalog {
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
        Err(Error::NoSuchReference(id.to_string()))
    }

    async fn stream(&self, _id: &str) -> Result<AudioDownload> {
        let data = vec![0u8; 16];
        Ok(AudioDownload {
            content_length: Some(data.len() as u64),
            stream: futures::stream::once(async move { Ok(Bytes::from(data)) }).boxed(),
        })
    }
}

/// Engine fixture: accepts every file and reports a fixed-length track.
#[derive(Default)]
struct TestEngine {
    position: Mutex<Option<EnginePosition>>,
}

#[async_trait]
impl AudioEngine for TestEngine {
    async fn load(&self, _path: &Path) -> Result<()> {
        *self.position.lock().unwrap() = Some(EnginePosition {
            time: 0.0,
            length: 180.0,
            percent: 0,
        });
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.position.lock().unwrap() = None;
        Ok(())
    }

    async fn seek_to(&self, seconds: f64) -> Result<()> {
        if let Some(pos) = self.position.lock().unwrap().as_mut() {
            pos.time = seconds;
        }
        Ok(())
    }

    async fn position(&self) -> Option<EnginePosition> {
        *self.position.lock().unwrap()
    }
}

struct TestServer {
    addr: SocketAddr,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn CatalogBackend> = Arc::new(TestCatalog::new());

    let cache = Arc::new(
        CacheManager::new(Arc::clone(&backend), dir.path().to_path_buf(), 1024 * 1024)
            .await
            .unwrap(),
    );
    let resolver = Resolver::new(Arc::clone(&backend));

    let (finished_tx, finished_rx) = mpsc::channel(1);
    let controller = PlayerController::new(Box::new(TestEngine::default()), finished_tx);
    let session = Session::spawn(resolver, cache, controller, false, finished_rx);

    let server = ProtocolServer::bind("127.0.0.1:0".parse().unwrap(), session)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    TestServer { addr, _dir: dir }
}

/// One request/response exchange, the way the client does it.
async fn send(addr: SocketAddr, request: Value) -> Value {
    send_raw(addr, request.to_string().as_bytes()).await
}

async fn send_raw(addr: SocketAddr, raw: &[u8]) -> Value {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    serde_json::from_slice(&buf).expect("response should be JSON")
}

/// Poll until `check` accepts a response to `request`.
async fn wait_for(addr: SocketAddr, request: Value, check: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..400 {
        let response = send(addr, request.clone()).await;
        if check(&response) {
            return response;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("server never reached expected state for {request}");
}

#[tokio::test]
async fn test_status_with_nothing_selected() {
    let server = start_server().await;
    let response = send(server.addr, json!({"operation": "status"})).await;
    assert_eq!(response["code"], "OK");
    assert_eq!(response["current_song"], Value::Null);
}

#[tokio::test]
async fn test_unknown_operation_is_rejected() {
    let server = start_server().await;
    let response = send(server.addr, json!({"operation": "explode"})).await;
    assert_eq!(response["code"], "ERROR");
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("Operation not permitted"));
}

#[tokio::test]
async fn test_missing_operation_is_rejected() {
    let server = start_server().await;
    let response = send(server.addr, json!({"data": [1, 2, 3]})).await;
    assert_eq!(response["code"], "ERROR");
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("No operation given"));
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let server = start_server().await;
    let response = send_raw(server.addr, b"this is not json").await;
    assert_eq!(response["code"], "ERROR");
    assert!(response["message"]
        .as_str()
        .unwrap()
        .starts_with("Malformed request"));
}

#[tokio::test]
async fn test_play_with_empty_queue() {
    let server = start_server().await;
    let response = send(server.addr, json!({"operation": "play"})).await;
    assert_eq!(response["code"], "ERROR");
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("no queue"));
}

#[tokio::test]
async fn test_set_queue_from_artist_is_sorted() {
    let server = start_server().await;
    let response = send(
        server.addr,
        json!({
            "operation": "set_queue",
            "data": {"artist": [{"id": "ar1", "name": "Artist ar1"}]}
        }),
    )
    .await;
    assert_eq!(response["code"], "OK");

    let response = wait_for(server.addr, json!({"operation": "show_queue"}), |r| {
        r["queue"].as_array().map(|q| q.len()) == Some(3)
    })
    .await;

    // Artist-built queues come back in canonical track order.
    let ids: Vec<&str> = response["queue"]
        .as_array()
        .unwrap()
        .iter()
        .map(|song| song["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["s0", "s1", "s2"]);

    // Replacing the queue leaves nothing selected.
    let status = send(server.addr, json!({"operation": "status"})).await;
    assert_eq!(status["current_song"], Value::Null);
}

#[tokio::test]
async fn test_play_and_status_round_trip() {
    let server = start_server().await;
    send(
        server.addr,
        json!({"operation": "set_queue", "data": {"artist": [{"id": "ar1"}]}}),
    )
    .await;
    wait_for(server.addr, json!({"operation": "show_queue"}), |r| {
        r["queue"].as_array().map(|q| q.len()) == Some(3)
    })
    .await;

    let response = send(server.addr, json!({"operation": "play", "queue_index": 1})).await;
    assert_eq!(response["code"], "OK");

    let status = wait_for(server.addr, json!({"operation": "status"}), |r| {
        r["current_song"]["player_state"] == "Playing"
    })
    .await;

    let current = &status["current_song"];
    assert_eq!(current["song"]["id"], "s1");
    assert_eq!(current["queue"]["index"], 1);
    assert_eq!(current["queue"]["length"], 3);
    assert_eq!(current["shuffle"], false);
    assert_eq!(current["repeat"], false);
    assert_eq!(current["downloading"], false);
    assert_eq!(current["progress"]["length"], 180);
}

#[tokio::test]
async fn test_next_at_tail_reports_failure_and_server_survives() {
    let server = start_server().await;
    send(
        server.addr,
        json!({"operation": "set_queue", "data": {"artist": [{"id": "ar1"}]}}),
    )
    .await;
    wait_for(server.addr, json!({"operation": "show_queue"}), |r| {
        r["queue"].as_array().map(|q| q.len()) == Some(3)
    })
    .await;

    send(server.addr, json!({"operation": "play", "queue_index": 2})).await;
    wait_for(server.addr, json!({"operation": "status"}), |r| {
        r["current_song"]["player_state"] == "Playing"
    })
    .await;

    let response = send(server.addr, json!({"operation": "next_song"})).await;
    assert_eq!(response["code"], "ERROR");
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("next song"));

    // Selection is gone and the server keeps answering.
    let status = send(server.addr, json!({"operation": "status"})).await;
    assert_eq!(status["code"], "OK");
    assert_eq!(status["current_song"], Value::Null);
}

#[tokio::test]
async fn test_repeat_and_seek() {
    let server = start_server().await;
    send(
        server.addr,
        json!({"operation": "set_queue", "data": {"artist": [{"id": "ar1"}]}}),
    )
    .await;
    wait_for(server.addr, json!({"operation": "show_queue"}), |r| {
        r["queue"].as_array().map(|q| q.len()) == Some(3)
    })
    .await;

    send(server.addr, json!({"operation": "repeat", "value": true})).await;
    send(server.addr, json!({"operation": "play"})).await;
    let status = wait_for(server.addr, json!({"operation": "status"}), |r| {
        r["current_song"]["player_state"] == "Playing"
    })
    .await;
    assert_eq!(status["current_song"]["repeat"], true);

    let response = send(server.addr, json!({"operation": "seek", "timedelta": 30})).await;
    assert_eq!(response["code"], "OK");
    wait_for(server.addr, json!({"operation": "status"}), |r| {
        r["current_song"]["progress"]["time"] == 30
    })
    .await;

    // Seek requires a timedelta.
    let response = send(server.addr, json!({"operation": "seek"})).await;
    assert_eq!(response["code"], "ERROR");
}

#[tokio::test]
async fn test_remove_from_queue_sentinel() {
    let server = start_server().await;
    send(
        server.addr,
        json!({"operation": "set_queue", "data": {"artist": [{"id": "ar1"}]}}),
    )
    .await;
    wait_for(server.addr, json!({"operation": "show_queue"}), |r| {
        r["queue"].as_array().map(|q| q.len()) == Some(3)
    })
    .await;

    // Arbitrary removal is rejected with a diagnostic.
    let response = send(
        server.addr,
        json!({"operation": "remove_from_queue", "data": [0, 1]}),
    )
    .await;
    assert_eq!(response["code"], "ERROR");
    assert!(response["message"].as_str().unwrap().contains("[-1]"));

    // The sentinel clears everything.
    let response = send(
        server.addr,
        json!({"operation": "remove_from_queue", "data": [-1]}),
    )
    .await;
    assert_eq!(response["code"], "OK");

    let response = send(server.addr, json!({"operation": "show_queue"})).await;
    assert_eq!(response["queue"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_append_queue_selects_head_without_playing() {
    let server = start_server().await;
    let response = send(
        server.addr,
        json!({"operation": "append_queue", "data": {"song": [{"id": "s0"}]}}),
    )
    .await;
    assert_eq!(response["code"], "OK");

    let status = wait_for(server.addr, json!({"operation": "status"}), |r| {
        !r["current_song"].is_null()
    })
    .await;
    let current = &status["current_song"];
    assert_eq!(current["song"]["id"], "s0");
    assert_eq!(current["queue"]["index"], 0);
    assert_eq!(current["queue"]["length"], 1);
    assert_eq!(current["player_state"], "Stopped");
}
