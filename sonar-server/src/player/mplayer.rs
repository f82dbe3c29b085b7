//! External mplayer process driven in slave mode
//!
//! Commands go to the child's stdin; a reader task parses the `ANS_*`
//! answers and the `EOF code` line mplayer prints (at `-msglevel global=6`)
//! when a file finishes. `EOF code: 1` means the file played to its natural
//! end and is the only code that raises [`EngineEvent::TrackFinished`].

use crate::player::{AudioEngine, EngineEvent, EnginePosition};
use async_trait::async_trait;
use sonar_common::error::{Error, Result};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

const POLL_INTERVAL_MS: u64 = 500;

/// End-of-file code mplayer reports for a file that played to completion.
const EOF_NATURAL: u32 = 1;

#[derive(Debug, Default, Clone, Copy)]
struct EngineStatus {
    time: Option<f64>,
    length: Option<f64>,
    percent: Option<u32>,
    loaded: bool,
    paused: bool,
}

/// One long-lived mplayer child shared by all playback operations.
pub struct MplayerEngine {
    stdin: Arc<Mutex<ChildStdin>>,
    status: Arc<StdMutex<EngineStatus>>,
    // Held so the child is killed when the engine goes away.
    _child: StdMutex<Child>,
}

impl MplayerEngine {
    /// Spawn the engine process and its reader/poller tasks.
    ///
    /// `events` receives a lossy `TrackFinished` whenever a file ends
    /// naturally.
    pub fn spawn(
        command: &str,
        extra_args: &[String],
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Self> {
        let mut child = Command::new(command)
            .args(["-slave", "-idle", "-really-quiet", "-msglevel", "global=6"])
            .args(extra_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Playback(format!("could not start {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Playback("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Playback("engine stdout unavailable".into()))?;

        let status = Arc::new(StdMutex::new(EngineStatus::default()));
        let stdin = Arc::new(Mutex::new(stdin));

        // Reader: one line per answer or event.
        {
            let status = Arc::clone(&status);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parse_answer(&line) {
                        Some(Answer::Time(t)) => {
                            status.lock().unwrap().time = Some(t);
                        }
                        Some(Answer::Length(l)) => {
                            status.lock().unwrap().length = Some(l);
                        }
                        Some(Answer::Percent(p)) => {
                            status.lock().unwrap().percent = Some(p);
                        }
                        Some(Answer::Eof(code)) => {
                            debug!("Engine EOF code {}", code);
                            {
                                let mut status = status.lock().unwrap();
                                status.loaded = false;
                                status.time = None;
                                status.percent = None;
                            }
                            if code == EOF_NATURAL {
                                // Capacity-1 channel; a pending signal
                                // already covers this advance.
                                let _ = events.try_send(EngineEvent::TrackFinished);
                            }
                        }
                        None => {}
                    }
                }
                debug!("Engine stdout closed");
            });
        }

        // Poller: refresh position while a file is playing.
        {
            let status = Arc::clone(&status);
            let stdin = Arc::clone(&stdin);
            tokio::spawn(async move {
                let mut tick = interval(Duration::from_millis(POLL_INTERVAL_MS));
                loop {
                    tick.tick().await;
                    let snapshot = *status.lock().unwrap();
                    if !snapshot.loaded || snapshot.paused {
                        continue;
                    }
                    let mut stdin = stdin.lock().await;
                    let query = "pausing_keep get_time_pos\n\
                                 pausing_keep get_time_length\n\
                                 pausing_keep get_percent_pos\n";
                    if stdin.write_all(query.as_bytes()).await.is_err() {
                        warn!("Engine stdin closed; stopping position poll");
                        break;
                    }
                }
            });
        }

        Ok(Self {
            stdin,
            status,
            _child: StdMutex::new(child),
        })
    }

    async fn send(&self, command: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(format!("{command}\n").as_bytes())
            .await
            .map_err(|e| Error::Playback(format!("engine command failed: {e}")))
    }
}

#[async_trait]
impl AudioEngine for MplayerEngine {
    async fn load(&self, path: &Path) -> Result<()> {
        let escaped = escape_path(&path.to_string_lossy());
        self.send(&format!("loadfile \"{escaped}\"")).await?;
        let mut status = self.status.lock().unwrap();
        *status = EngineStatus {
            loaded: true,
            ..EngineStatus::default()
        };
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let paused = self.status.lock().unwrap().paused;
        if !paused {
            self.send("pause").await?;
            self.status.lock().unwrap().paused = true;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let paused = self.status.lock().unwrap().paused;
        if paused {
            self.send("pause").await?;
            self.status.lock().unwrap().paused = false;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.send("stop").await?;
        let mut status = self.status.lock().unwrap();
        *status = EngineStatus::default();
        Ok(())
    }

    async fn seek_to(&self, seconds: f64) -> Result<()> {
        self.send(&format!("seek {seconds:.1} 2")).await?;
        self.status.lock().unwrap().time = Some(seconds);
        Ok(())
    }

    async fn position(&self) -> Option<EnginePosition> {
        let status = *self.status.lock().unwrap();
        if !status.loaded {
            return None;
        }
        let time = status.time?;
        let length = status.length.unwrap_or(0.0);
        let percent = status.percent.unwrap_or_else(|| {
            if length > 0.0 {
                ((time / length) * 100.0) as u32
            } else {
                0
            }
        });
        Some(EnginePosition {
            time,
            length,
            percent,
        })
    }
}

#[derive(Debug, PartialEq)]
enum Answer {
    Time(f64),
    Length(f64),
    Percent(u32),
    Eof(u32),
}

fn parse_answer(line: &str) -> Option<Answer> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("ANS_TIME_POSITION=") {
        return rest.parse().ok().map(Answer::Time);
    }
    if let Some(rest) = line.strip_prefix("ANS_LENGTH=") {
        return rest.parse().ok().map(Answer::Length);
    }
    if let Some(rest) = line.strip_prefix("ANS_PERCENT_POSITION=") {
        return rest.parse().ok().map(Answer::Percent);
    }
    if let Some(rest) = line.strip_prefix("EOF code:") {
        return rest.trim().parse().ok().map(Answer::Eof);
    }
    None
}

/// Escape a path for mplayer's quoted loadfile argument.
fn escape_path(path: &str) -> String {
    path.replace('\\', "\\\\").replace('"', "\\\"")
}
