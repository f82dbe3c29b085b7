//! Sonar server - main entry point
//!
//! Long-running daemon that owns the playback session for a single client:
//! loads configuration, checks the media backend is reachable, spawns the
//! playback engine and session task, then serves the TCP control protocol
//! until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sonar_common::config::Config;
use sonar_server::backend::{CatalogBackend, SubsonicBackend};
use sonar_server::cache::CacheManager;
use sonar_server::player::{MplayerEngine, PlayerController};
use sonar_server::resolver::Resolver;
use sonar_server::server::ProtocolServer;
use sonar_server::session::Session;

/// Command-line arguments for sonar-server
#[derive(Parser, Debug)]
#[command(name = "sonar-server")]
#[command(about = "Personal music-streaming remote-control daemon")]
#[command(version)]
struct Args {
    /// Configuration file (default: ~/.config/sonar/sonar.toml)
    #[arg(short, long, env = "SONAR_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured listening port
    #[arg(short, long, env = "SONAR_PORT")]
    port: Option<u16>,

    /// Verbose output (i.e. show debug)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let default_filter = if args.verbose {
        "sonar_server=debug,sonar_common=debug"
    } else {
        "sonar_server=info,sonar_common=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let port = args.port.unwrap_or(config.server.port);

    info!("Starting sonar server on port {}", port);

    // The backend must be reachable before anything else starts.
    let backend: Arc<dyn CatalogBackend> = Arc::new(SubsonicBackend::new(
        &config.backend.url,
        &config.backend.username,
        &config.backend.password,
    ));
    backend
        .ping()
        .await
        .context("Could not connect to media backend; check your configuration")?;
    info!("Media backend reachable at {}", config.backend.url);

    let cache_dir = config.cache_dir().context("Failed to resolve cache directory")?;
    let cache = Arc::new(
        CacheManager::new(
            Arc::clone(&backend),
            cache_dir.clone(),
            config.cache_budget_bytes(),
        )
        .await
        .context("Failed to open cache directory")?,
    );
    info!("Cache directory: {}", cache_dir.display());

    // Track-finished signal: capacity 1, only one pending advance matters.
    let (finished_tx, finished_rx) = mpsc::channel(1);

    let engine = MplayerEngine::spawn(
        &config.player.command,
        &config.player.args,
        finished_tx.clone(),
    )
    .context("Failed to start playback engine")?;
    info!("Playback engine started ({})", config.player.command);

    let controller = PlayerController::new(Box::new(engine), finished_tx);
    let resolver = Resolver::new(Arc::clone(&backend));
    let session = Session::spawn(
        resolver,
        cache,
        controller,
        config.cache.prefetch,
        finished_rx,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, port))?;
    let server = ProtocolServer::bind(addr, session)
        .await
        .context("Could not start server socket")?;
    info!("Listening on {}", addr);

    tokio::select! {
        _ = server.run() => {},
        _ = shutdown_signal() => {
            info!("Server shutdown complete");
        }
    }

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
