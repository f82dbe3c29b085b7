//! Configuration loading and validation
//!
//! The daemon reads a single TOML file (default
//! `~/.config/sonar/sonar.toml`, overridable on the command line). A
//! missing or invalid file is fatal at startup: the server refuses to run
//! with guesswork credentials.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Listening socket settings for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

/// Remote media catalog (Subsonic-compatible) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://music.example.org:4040`
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Local audio cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache directory; defaults to the platform cache dir + `sonar/music`
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Total byte budget in megabytes
    #[serde(default = "default_cache_mb")]
    pub max_mb: u64,
    /// Fetch the next queued song in the background while one plays
    #[serde(default = "default_prefetch")]
    pub prefetch: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_mb: default_cache_mb(),
            prefetch: default_prefetch(),
        }
    }
}

/// External playback engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    /// Engine binary to spawn
    #[serde(default = "default_player_command")]
    pub command: String,
    /// Extra arguments passed to the engine binary
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            command: default_player_command(),
            args: Vec::new(),
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cache_mb() -> u64 {
    512
}

fn default_prefetch() -> bool {
    true
}

fn default_player_command() -> String {
    "mplayer".to_string()
}

impl Config {
    /// Load and validate configuration.
    ///
    /// `path` overrides the default location. Any problem is a fatal
    /// `Config` error naming the file or key at fault.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            return Err(Error::Config(format!(
                "No config file found. Copy and modify sonar.toml to {}",
                path.display()
            )));
        }

        debug!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(&path)?;
        Self::parse(&raw)
    }

    /// Parse and validate configuration from TOML text.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| Error::Config(format!("Malformed config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file location: `<config dir>/sonar/sonar.toml`.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join("sonar").join("sonar.toml"))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
    }

    /// Resolved cache directory (configured or platform default).
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache.dir {
            return Ok(dir.clone());
        }
        dirs::cache_dir()
            .map(|d| d.join("sonar").join("music"))
            .ok_or_else(|| Error::Config("Could not determine cache directory".to_string()))
    }

    /// Cache byte budget derived from `cache.max_mb`.
    pub fn cache_budget_bytes(&self) -> u64 {
        self.cache.max_mb * 1024 * 1024
    }

    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be non-zero".to_string()));
        }
        if self.backend.url.is_empty() {
            return Err(Error::Config("backend.url must be set".to_string()));
        }
        if self.backend.username.is_empty() {
            return Err(Error::Config("backend.username must be set".to_string()));
        }
        if self.cache.max_mb == 0 {
            return Err(Error::Config("cache.max_mb must be non-zero".to_string()));
        }
        if self.player.command.is_empty() {
            return Err(Error::Config("player.command must be set".to_string()));
        }
        Ok(())
    }
}
