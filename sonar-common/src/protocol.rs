//! Wire protocol: one JSON request and one JSON response per TCP connection
//!
//! A request is an object carrying an `"operation"` name plus
//! operation-specific fields; the response is `{"code": "OK"|"ERROR", ...}`
//! with a human-readable `message` on error. Requests must fit within
//! [`MAX_REQUEST_BYTES`].

use crate::error::{Error, Result};
use crate::types::{PlaybackState, Progress, QueueRefs, Song};
use serde::{Deserialize, Serialize};

/// Upper bound on a single request; the original protocol reads one
/// bounded buffer per connection.
pub const MAX_REQUEST_BYTES: usize = 100 * 1024;

/// Clearing the whole queue is signalled with this sentinel index list;
/// removal of arbitrary indices is unsupported.
pub const REMOVE_ALL_SENTINEL: i64 = -1;

/// Client request, dispatched on the `operation` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Request {
    Status,
    Play {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue_index: Option<usize>,
    },
    Pause,
    Stop,
    PreviousSong,
    NextSong,
    Seek {
        /// Relative seek in whole seconds (may be negative)
        timedelta: i64,
    },
    Repeat {
        /// Absent toggles; present sets explicitly
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<bool>,
    },
    Shuffle,
    SortQueue,
    SetQueue {
        data: QueueRefs,
    },
    PrependQueue {
        data: QueueRefs,
    },
    AppendQueue {
        data: QueueRefs,
    },
    RemoveFromQueue {
        data: Vec<i64>,
    },
    ShowQueue,
}

impl Request {
    /// Parse a request from raw connection bytes.
    ///
    /// Distinguishes a missing operation from an unrecognized one so the
    /// client sees the same diagnostics the original server produced.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| Error::MalformedRequest(format!("invalid JSON: {e}")))?;

        if value.get("operation").is_none() {
            return Err(Error::MalformedRequest("No operation given.".into()));
        }

        serde_json::from_value(value)
            .map_err(|_| Error::MalformedRequest("Operation not permitted.".into()))
    }
}

/// Position of the current song within the queue, as reported in `status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuePosition {
    pub index: usize,
    pub length: usize,
}

/// Payload of the `status` operation when a song is selected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusInfo {
    pub song: Song,
    pub player_state: PlaybackState,
    pub progress: Option<Progress>,
    pub shuffle: bool,
    pub repeat: bool,
    pub queue: QueuePosition,
    /// Whether the current song's download is still in flight
    pub downloading: bool,
}

/// Response code: every reply is either OK or ERROR.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseCode {
    Ok,
    Error,
}

/// Server response, serialized as a single JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Present (possibly null) only for `status` responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_song: Option<Option<StatusInfo>>,
    /// Present only for `show_queue` responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<Vec<Song>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            code: ResponseCode::Ok,
            message: None,
            current_song: None,
            queue: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Error,
            message: Some(message.into()),
            current_song: None,
            queue: None,
        }
    }

    pub fn status(current_song: Option<StatusInfo>) -> Self {
        Self {
            current_song: Some(current_song),
            ..Self::ok()
        }
    }

    pub fn queue(queue: Vec<Song>) -> Self {
        Self {
            queue: Some(queue),
            ..Self::ok()
        }
    }
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Self {
        Response::error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operations() {
        let req = Request::parse(br#"{"operation": "status"}"#).unwrap();
        assert_eq!(req, Request::Status);

        let req = Request::parse(br#"{"operation": "play", "queue_index": 3}"#).unwrap();
        assert_eq!(
            req,
            Request::Play {
                queue_index: Some(3)
            }
        );

        let req = Request::parse(br#"{"operation": "seek", "timedelta": -10}"#).unwrap();
        assert_eq!(req, Request::Seek { timedelta: -10 });

        let req =
            Request::parse(br#"{"operation": "remove_from_queue", "data": [-1]}"#).unwrap();
        assert_eq!(req, Request::RemoveFromQueue { data: vec![-1] });
    }

    #[test]
    fn test_parse_set_queue_data() {
        let raw = json!({
            "operation": "set_queue",
            "data": {
                "artist": [{"id": "ar1", "name": "Some Artist"}],
                "album": [],
                "song": []
            }
        });
        let req = Request::parse(raw.to_string().as_bytes()).unwrap();
        match req {
            Request::SetQueue { data } => {
                assert_eq!(data.artist.len(), 1);
                assert_eq!(data.artist[0].id, "ar1");
                assert!(data.playlist.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_missing_operation() {
        let err = Request::parse(br#"{"foo": 1}"#).unwrap_err();
        assert_eq!(err.to_string(), "Malformed request: No operation given.");
    }

    #[test]
    fn test_parse_unknown_operation() {
        let err = Request::parse(br#"{"operation": "explode"}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Malformed request: Operation not permitted."
        );
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = Request::parse(b"not json at all").unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::MalformedRequest(_)
        ));
    }

    #[test]
    fn test_response_envelopes() {
        let v = serde_json::to_value(Response::ok()).unwrap();
        assert_eq!(v, json!({"code": "OK"}));

        let v = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(v, json!({"code": "ERROR", "message": "boom"}));

        // status with nothing selected carries an explicit null
        let v = serde_json::to_value(Response::status(None)).unwrap();
        assert_eq!(v, json!({"code": "OK", "current_song": null}));
    }
}
