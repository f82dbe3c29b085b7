//! Playback control
//!
//! `PlayerController` is the state machine the session drives; the actual
//! decoding and audio output live in an external engine behind the
//! [`AudioEngine`] trait. State changes only through controller operations
//! or the engine's end-of-track signal.

use async_trait::async_trait;
use sonar_common::error::{Error, Result};
use sonar_common::types::{PlaybackState, Progress};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod mplayer;

pub use mplayer::MplayerEngine;

/// Position snapshot reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnginePosition {
    /// Elapsed seconds
    pub time: f64,
    /// Track length in seconds
    pub length: f64,
    pub percent: u32,
}

/// Out-of-band engine notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The loaded file played to its natural end (not a user stop)
    TrackFinished,
}

/// The external playback engine: loads and plays one local file at a time.
#[async_trait]
pub trait AudioEngine: Send + Sync {
    /// Load a file and start playing it, replacing whatever was loaded.
    async fn load(&self, path: &Path) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Seek to an absolute position in seconds.
    async fn seek_to(&self, seconds: f64) -> Result<()>;
    /// Current position, or None when nothing is loaded.
    async fn position(&self) -> Option<EnginePosition>;
}

/// State machine wrapping the playback engine.
///
/// Transitions: Stopped -> Playing on a successful load; Playing <-> Paused
/// on pause/resume; anything -> Stopped on stop, engine failure, or the
/// track-finished signal.
pub struct PlayerController {
    engine: Box<dyn AudioEngine>,
    state: PlaybackState,
    /// Shared with the engine; seek-past-end pushes the same signal a
    /// natural end of track does.
    finished_tx: mpsc::Sender<EngineEvent>,
}

impl PlayerController {
    pub fn new(engine: Box<dyn AudioEngine>, finished_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            engine,
            state: PlaybackState::Stopped,
            finished_tx,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Load and play a local file.
    pub async fn play_file(&mut self, path: &Path) -> Result<()> {
        debug!("Playing file: {}", path.display());
        match self.engine.load(path).await {
            Ok(()) => {
                self.state = PlaybackState::Playing;
                Ok(())
            }
            Err(e) => {
                self.state = PlaybackState::Stopped;
                Err(Error::Playback(format!("{}: {e}", path.display())))
            }
        }
    }

    /// Playing -> Paused; no-op otherwise.
    pub async fn pause(&mut self) -> Result<()> {
        if self.state == PlaybackState::Playing {
            self.engine.pause().await?;
            self.state = PlaybackState::Paused;
        }
        Ok(())
    }

    /// Paused -> Playing; no-op otherwise.
    pub async fn resume(&mut self) -> Result<()> {
        if self.state == PlaybackState::Paused {
            self.engine.resume().await?;
            self.state = PlaybackState::Playing;
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if self.state != PlaybackState::Stopped {
            self.engine.stop().await?;
        }
        self.state = PlaybackState::Stopped;
        Ok(())
    }

    /// The engine reported a natural end of track.
    pub fn on_track_finished(&mut self) {
        self.state = PlaybackState::Stopped;
    }

    /// Seek relative to the current position, clamped to the track.
    ///
    /// Seeking past the end of the track is not an error: it counts as the
    /// track finishing and triggers the same auto-advance signal.
    pub async fn seek(&mut self, delta_seconds: i64) -> Result<()> {
        if self.state == PlaybackState::Stopped {
            return Ok(());
        }
        let Some(position) = self.engine.position().await else {
            return Ok(());
        };

        let target = position.time + delta_seconds as f64;
        if target < 0.0 {
            self.engine.seek_to(0.0).await
        } else if position.length > 0.0 && target > position.length {
            debug!("Seek past end of track; treating as finished");
            if self.finished_tx.try_send(EngineEvent::TrackFinished).is_err() {
                warn!("Track-finished signal already pending");
            }
            Ok(())
        } else {
            self.engine.seek_to(target).await
        }
    }

    /// Playback progress, or None when stopped or the engine has nothing
    /// to report yet.
    pub async fn progress(&self) -> Option<Progress> {
        if self.state == PlaybackState::Stopped {
            return None;
        }
        self.engine.position().await.map(|p| Progress {
            percent: p.percent,
            time: p.time.max(0.0) as u64,
            length: p.length.max(0.0) as u64,
        })
    }
}
