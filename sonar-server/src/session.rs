//! Playback session: queue, current position, and session flags
//!
//! All session state is owned by a single task that applies commands in
//! arrival order; handlers talk to it through a [`SessionHandle`].
//! Backend-bound work (queue resolution, song downloads) runs on spawned
//! workers that post a completion command back to the owner instead of
//! touching state themselves, so a slow backend never stalls the loop.

use crate::cache::CacheManager;
use crate::player::{EngineEvent, PlayerController};
use crate::resolver::Resolver;
use rand::seq::SliceRandom;
use sonar_common::error::{Error, Result};
use sonar_common::protocol::{QueuePosition, StatusInfo, REMOVE_ALL_SENTINEL};
use sonar_common::types::{PlaybackState, QueueRefs, Song};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 32;

type Reply = oneshot::Sender<Result<()>>;

/// Where resolved songs are spliced into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpliceMode {
    Replace,
    Prepend,
    Append,
}

enum Command {
    Status {
        reply: oneshot::Sender<Option<StatusInfo>>,
    },
    ShowQueue {
        reply: oneshot::Sender<Vec<Song>>,
    },
    Play {
        index: Option<usize>,
        reply: Reply,
    },
    Pause {
        reply: Reply,
    },
    Stop {
        reply: Reply,
    },
    Next {
        reply: Reply,
    },
    Previous {
        reply: Reply,
    },
    Seek {
        delta: i64,
        reply: Reply,
    },
    Repeat {
        value: Option<bool>,
        reply: Reply,
    },
    Shuffle {
        reply: Reply,
    },
    SortQueue {
        reply: Reply,
    },
    SetQueue {
        refs: QueueRefs,
        reply: Reply,
    },
    PrependQueue {
        refs: QueueRefs,
        reply: Reply,
    },
    AppendQueue {
        refs: QueueRefs,
        reply: Reply,
    },
    RemoveFromQueue {
        indices: Vec<i64>,
        reply: Reply,
    },
    /// A resolve worker finished building songs for a splice.
    ApplyQueue {
        mode: SpliceMode,
        sort: bool,
        songs: Vec<Song>,
    },
    /// A fetch worker finished downloading the selected song.
    PlayReady {
        seq: u64,
        song_id: String,
        result: Result<PathBuf>,
    },
}

/// Cloneable handle used by connection handlers to reach the session task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::Internal("session is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("session dropped the reply".into()))
    }

    pub async fn status(&self) -> Result<Option<StatusInfo>> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn show_queue(&self) -> Result<Vec<Song>> {
        self.request(|reply| Command::ShowQueue { reply }).await
    }

    pub async fn play(&self, index: Option<usize>) -> Result<()> {
        self.request(|reply| Command::Play { index, reply }).await?
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| Command::Pause { reply }).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    pub async fn next_song(&self) -> Result<()> {
        self.request(|reply| Command::Next { reply }).await?
    }

    pub async fn previous_song(&self) -> Result<()> {
        self.request(|reply| Command::Previous { reply }).await?
    }

    pub async fn seek(&self, delta: i64) -> Result<()> {
        self.request(|reply| Command::Seek { delta, reply }).await?
    }

    pub async fn repeat(&self, value: Option<bool>) -> Result<()> {
        self.request(|reply| Command::Repeat { value, reply }).await?
    }

    pub async fn shuffle(&self) -> Result<()> {
        self.request(|reply| Command::Shuffle { reply }).await?
    }

    pub async fn sort_queue(&self) -> Result<()> {
        self.request(|reply| Command::SortQueue { reply }).await?
    }

    pub async fn set_queue(&self, refs: QueueRefs) -> Result<()> {
        self.request(|reply| Command::SetQueue { refs, reply }).await?
    }

    pub async fn prepend_queue(&self, refs: QueueRefs) -> Result<()> {
        self.request(|reply| Command::PrependQueue { refs, reply })
            .await?
    }

    pub async fn append_queue(&self, refs: QueueRefs) -> Result<()> {
        self.request(|reply| Command::AppendQueue { refs, reply })
            .await?
    }

    pub async fn remove_from_queue(&self, indices: Vec<i64>) -> Result<()> {
        self.request(|reply| Command::RemoveFromQueue { indices, reply })
            .await?
    }
}

/// The session state and its owner loop.
pub struct Session {
    queue: Vec<Song>,
    current: Option<usize>,
    shuffle: bool,
    repeat: bool,
    controller: PlayerController,
    resolver: Resolver,
    cache: Arc<CacheManager>,
    prefetch_enabled: bool,
    /// Sender cloned into workers so completions come back as commands
    commands: mpsc::Sender<Command>,
    /// Bumped on every selection; stale fetch completions are dropped
    play_seq: u64,
}

impl Session {
    /// Start the session task and return the handle to it.
    ///
    /// `finished` is the capacity-1 channel carrying the engine's
    /// track-finished signal; the loop drains it between commands and
    /// auto-advances.
    pub fn spawn(
        resolver: Resolver,
        cache: Arc<CacheManager>,
        controller: PlayerController,
        prefetch_enabled: bool,
        finished: mpsc::Receiver<EngineEvent>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let session = Session {
            queue: Vec::new(),
            current: None,
            shuffle: false,
            repeat: false,
            controller,
            resolver,
            cache,
            prefetch_enabled,
            commands: commands_tx.clone(),
            play_seq: 0,
        };
        tokio::spawn(session.run(commands_rx, finished));
        SessionHandle {
            commands: commands_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut finished: mpsc::Receiver<EngineEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                event = finished.recv() => match event {
                    Some(EngineEvent::TrackFinished) => {
                        debug!("Track finished; advancing");
                        self.controller.on_track_finished();
                        if let Err(e) = self.advance_next().await {
                            info!("{}", e);
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("Session loop ended");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Status { reply } => {
                let _ = reply.send(self.status().await);
            }
            Command::ShowQueue { reply } => {
                let _ = reply.send(self.queue.clone());
            }
            Command::Play { index, reply } => {
                let _ = reply.send(self.play(index).await);
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.controller.pause().await);
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop().await);
            }
            Command::Next { reply } => {
                let _ = reply.send(self.advance_next().await);
            }
            Command::Previous { reply } => {
                let _ = reply.send(self.advance_previous().await);
            }
            Command::Seek { delta, reply } => {
                let _ = reply.send(self.controller.seek(delta).await);
            }
            Command::Repeat { value, reply } => {
                self.set_repeat(value);
                let _ = reply.send(Ok(()));
            }
            Command::Shuffle { reply } => {
                self.shuffle_queue();
                let _ = reply.send(Ok(()));
            }
            Command::SortQueue { reply } => {
                self.sort_queue();
                let _ = reply.send(Ok(()));
            }
            Command::SetQueue { refs, reply } => {
                let _ = reply.send(self.build_queue(SpliceMode::Replace, refs));
            }
            Command::PrependQueue { refs, reply } => {
                let _ = reply.send(self.build_queue(SpliceMode::Prepend, refs));
            }
            Command::AppendQueue { refs, reply } => {
                let _ = reply.send(self.build_queue(SpliceMode::Append, refs));
            }
            Command::RemoveFromQueue { indices, reply } => {
                let _ = reply.send(self.remove_from_queue(indices).await);
            }
            Command::ApplyQueue { mode, sort, songs } => {
                self.apply_queue(mode, sort, songs).await;
            }
            Command::PlayReady {
                seq,
                song_id,
                result,
            } => {
                self.on_play_ready(seq, song_id, result).await;
            }
        }
    }

    async fn status(&self) -> Option<StatusInfo> {
        let index = self.current?;
        let song = self.queue.get(index)?.clone();
        let downloading = self.cache.is_downloading(&song.id).await;
        Some(StatusInfo {
            player_state: self.controller.state(),
            progress: self.controller.progress().await,
            shuffle: self.shuffle,
            repeat: self.repeat,
            queue: QueuePosition {
                index,
                length: self.queue.len(),
            },
            downloading,
            song,
        })
    }

    async fn play(&mut self, index: Option<usize>) -> Result<()> {
        if self.queue.is_empty() {
            return Err(Error::EmptyQueue);
        }
        match index {
            Some(index) => self.play_selected(index).await,
            None => match self.controller.state() {
                PlaybackState::Paused => self.controller.resume().await,
                PlaybackState::Playing => Ok(()),
                PlaybackState::Stopped => {
                    let index = self.current.unwrap_or(0);
                    self.play_selected(index).await
                }
            },
        }
    }

    /// Select a queue slot and start playing it.
    ///
    /// The download (or cache touch) runs on a worker; playback starts
    /// when its completion comes back, unless the selection changed in
    /// the meantime. A download already in flight (typically a prefetch)
    /// is waited out rather than duplicated — the status `downloading`
    /// flag covers the gap.
    async fn play_selected(&mut self, index: usize) -> Result<()> {
        let song = self
            .queue
            .get(index)
            .cloned()
            .ok_or(Error::IndexOutOfRange(index))?;

        debug!("Selecting queue slot {} ({})", index, song.id);
        self.current = Some(index);
        self.play_seq += 1;
        let seq = self.play_seq;

        let cache = Arc::clone(&self.cache);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = loop {
                match cache.fetch(&song.id).await {
                    Err(Error::Busy(_)) => {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                    other => break other,
                }
            };
            let _ = commands
                .send(Command::PlayReady {
                    seq,
                    song_id: song.id,
                    result,
                })
                .await;
        });
        Ok(())
    }

    async fn on_play_ready(&mut self, seq: u64, song_id: String, result: Result<PathBuf>) {
        if seq != self.play_seq {
            debug!("Ignoring stale fetch completion for {}", song_id);
            return;
        }
        let still_current = self
            .current
            .and_then(|index| self.queue.get(index))
            .map(|song| song.id == song_id)
            .unwrap_or(false);
        if !still_current {
            debug!("Queue changed while {} downloaded; not playing it", song_id);
            return;
        }

        match result {
            Ok(path) => {
                if let Err(e) = self.start_playback(&path).await {
                    error!("Could not play {}: {}", song_id, e);
                }
            }
            Err(e) => {
                // The selection stays put; advancing here would cascade
                // through the queue on a dead backend.
                warn!("Could not fetch {}: {}", song_id, e);
                if let Err(e) = self.controller.stop().await {
                    warn!("Stop after failed fetch: {}", e);
                }
            }
        }
    }

    async fn start_playback(&mut self, path: &PathBuf) -> Result<()> {
        self.controller.play_file(path).await?;
        if self.prefetch_enabled {
            self.prefetch_next();
        }
        Ok(())
    }

    /// Warm the cache for the song `advance_next` would pick.
    fn prefetch_next(&self) {
        let Some(current) = self.current else { return };
        let Some(next) = self.peek_next(current) else {
            return;
        };
        if next == current {
            return;
        }
        if let Some(song) = self.queue.get(next) {
            self.cache.prefetch(song.id.clone());
        }
    }

    fn peek_next(&self, from: usize) -> Option<usize> {
        if self.queue.is_empty() {
            return None;
        }
        let next = from + 1;
        if next < self.queue.len() {
            Some(next)
        } else if self.repeat {
            Some(0)
        } else {
            None
        }
    }

    fn peek_previous(&self, from: usize) -> Option<usize> {
        if self.queue.is_empty() {
            return None;
        }
        if from > 0 {
            Some(from - 1)
        } else if self.repeat {
            Some(self.queue.len() - 1)
        } else {
            None
        }
    }

    async fn advance_next(&mut self) -> Result<()> {
        if let Some(current) = self.current {
            if let Some(next) = self.peek_next(current) {
                return self.play_selected(next).await;
            }
        }
        self.halt().await;
        Err(Error::Playback("Could not play next song".into()))
    }

    async fn advance_previous(&mut self) -> Result<()> {
        if let Some(current) = self.current {
            if let Some(previous) = self.peek_previous(current) {
                return self.play_selected(previous).await;
            }
        }
        self.halt().await;
        Err(Error::Playback("Could not play previous song".into()))
    }

    /// Stop playback and drop the selection entirely.
    async fn halt(&mut self) {
        if let Err(e) = self.controller.stop().await {
            warn!("Engine stop failed: {}", e);
        }
        self.current = None;
    }

    /// User-initiated stop: playback ends, selection resets to the head.
    async fn stop(&mut self) -> Result<()> {
        self.controller.stop().await?;
        self.current = if self.queue.is_empty() { None } else { Some(0) };
        Ok(())
    }

    fn set_repeat(&mut self, value: Option<bool>) {
        self.repeat = value.unwrap_or(!self.repeat);
        info!("Repeat {}", if self.repeat { "on" } else { "off" });
    }

    /// Resolve references on a worker and splice the result in when the
    /// completion comes back.
    fn build_queue(&mut self, mode: SpliceMode, refs: QueueRefs) -> Result<()> {
        let sort = refs.wants_sort();
        let resolver = self.resolver.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let songs = resolver.resolve(&refs).await;
            let _ = commands.send(Command::ApplyQueue { mode, sort, songs }).await;
        });
        Ok(())
    }

    async fn apply_queue(&mut self, mode: SpliceMode, sort: bool, mut songs: Vec<Song>) {
        if sort {
            sort_songs(&mut songs);
        }
        match mode {
            SpliceMode::Replace => {
                if let Err(e) = self.controller.stop().await {
                    warn!("Engine stop failed: {}", e);
                }
                self.queue = songs;
                self.current = None;
            }
            SpliceMode::Prepend => {
                let added = songs.len();
                songs.extend(self.queue.drain(..));
                self.queue = songs;
                if let Some(current) = self.current {
                    self.current = Some(current + added);
                }
            }
            SpliceMode::Append => {
                self.queue.extend(songs);
            }
        }
        // A freshly non-empty queue selects its head without playing it.
        if mode != SpliceMode::Replace && self.current.is_none() && !self.queue.is_empty() {
            self.current = Some(0);
        }
        info!("Queue now has {} songs", self.queue.len());
    }

    async fn remove_from_queue(&mut self, indices: Vec<i64>) -> Result<()> {
        if indices.len() == 1 && indices[0] == REMOVE_ALL_SENTINEL {
            self.queue.clear();
            self.halt().await;
            return Ok(());
        }
        Err(Error::MalformedRequest(
            "Removing individual queue entries is not supported; send [-1] to clear the queue."
                .into(),
        ))
    }

    /// Shuffle the queue, keeping the current song at the head so what is
    /// playing keeps playing from the top.
    fn shuffle_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        if let Some(current) = self.current {
            let song = self.queue.remove(current);
            self.queue.shuffle(&mut rng);
            self.queue.insert(0, song);
            self.current = Some(0);
        } else {
            self.queue.shuffle(&mut rng);
        }
        self.shuffle = true;
    }

    fn sort_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let current_song = self.current.and_then(|index| self.queue.get(index).cloned());
        if !sort_songs(&mut self.queue) {
            debug!("Queue has songs without sort metadata; keeping order");
            return;
        }
        if let Some(song) = current_song {
            // Relocate by identity; with duplicate entries the first match
            // wins, falling back to the head.
            let index = self
                .queue
                .iter()
                .position(|s| s.id == song.id)
                .unwrap_or(0);
            self.current = Some(index);
        }
    }
}

/// Apply the canonical (artistId, albumId, discNumber, track) order.
///
/// Returns false — leaving the slice untouched — when any song lacks a
/// component of the key.
fn sort_songs(songs: &mut [Song]) -> bool {
    if songs.iter().any(|song| song.sort_key().is_none()) {
        return false;
    }
    songs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    true
}
