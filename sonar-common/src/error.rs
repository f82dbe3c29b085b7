//! Common error types for sonar

use thiserror::Error;

/// Common result type for sonar operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by the sonar daemon and its components
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not open the listening socket (fatal at startup)
    #[error("Could not bind server socket: {0}")]
    Bind(std::io::Error),

    /// Unknown or missing operation in a client request
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Playback was requested with nothing in the queue
    #[error("Can't play if there is no queue")]
    EmptyQueue,

    /// Queue index outside the current queue bounds
    #[error("Index not in queue: {0}")]
    IndexOutOfRange(usize),

    /// A catalog lookup failed for a single reference (skipped, not fatal)
    #[error("No such reference: {0}")]
    NoSuchReference(String),

    /// Downloading a song from the backend failed
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// The playback engine could not load or play a file
    #[error("Playback error: {0}")]
    Playback(String),

    /// A fetch for the same song is already in flight; retry shortly
    #[error("Busy: {0}")]
    Busy(String),

    /// Backend HTTP error
    #[error("Backend error: {0}")]
    Http(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error (wraps serde_json::Error)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error should abort the process rather than be reported
    /// to a client.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Bind(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Config("missing [server]".into()).is_fatal());
        assert!(!Error::EmptyQueue.is_fatal());
        assert!(!Error::Busy("dl in flight".into()).is_fatal());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::EmptyQueue.to_string(),
            "Can't play if there is no queue"
        );
        assert_eq!(Error::IndexOutOfRange(7).to_string(), "Index not in queue: 7");
    }
}
