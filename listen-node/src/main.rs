//! Listen Together - Headless Node
//!
//! Hosts a listening session or joins one as a listener, without any
//! audio output. Useful for exercising a relay and TURN setup end to end.
//!
//! Usage:
//!   listen-node host --audio https://example.org/a.mp3
//!   listen-node join <host-id or invitation url>
//!   listen-node --backend-host relay.example.org join k3x9w2ab

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use listen_core::listening::parse_peer_id;
use listen_core::sync::{ListeningState, StatePath};
use listen_core::{
    logging, AudioInfo, BackendConfig, HostConnectionState, ListeningRole, ListeningSession,
    MemoryMetadataCache, PeerContext, SessionCallback,
};
use tracing::info;

/// Headless listen-together node
#[derive(Parser)]
#[command(name = "listen-node")]
#[command(version)]
#[command(about = "Host or join a listen-together session")]
struct Cli {
    /// Backend config (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use this host for relay, STUN and TURN
    #[arg(long, global = true)]
    backend_host: Option<String>,

    /// Audio metadata to answer requests with (JSON list)
    #[arg(long, global = true)]
    metadata: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a new session
    Host {
        /// Audio to put in the playlist (repeatable)
        #[arg(long = "audio")]
        audio: Vec<String>,
    },

    /// Join a session as a listener
    Join {
        /// Host id or invitation URL
        host: String,
    },
}

struct LogCallback;

impl SessionCallback for LogCallback {
    fn on_role_changed(&self, role: ListeningRole) {
        info!("Role changed: {:?}", role);
    }

    fn on_host_connection_changed(&self, state: HostConnectionState) {
        info!("Host connection: {:?}", state);
    }
}

fn load_config(cli: &Cli) -> Result<BackendConfig, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => BackendConfig::from_json_file(path)?,
        None => BackendConfig::default(),
    };
    Ok(match &cli.backend_host {
        Some(host) => config.with_backend_host(host),
        None => config,
    })
}

fn load_metadata(cli: &Cli) -> Result<MemoryMetadataCache, Box<dyn std::error::Error>> {
    let cache = MemoryMetadataCache::new();
    if let Some(path) = &cli.metadata {
        let json = std::fs::read_to_string(path)?;
        let entries: Vec<AudioInfo> = serde_json::from_str(&json)?;
        for info in entries {
            cache.insert(info);
        }
        info!("Loaded metadata for {} audio(s)", cache.len());
    }
    Ok(cache)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let metadata = Arc::new(load_metadata(&cli)?);
    let ctx = PeerContext::webrtc(config, metadata);

    let session = match &cli.command {
        Commands::Host { audio } => {
            let session = ListeningSession::create_host(ctx)?;
            for uri in audio {
                session.add_audio(uri)?;
            }
            session
        }
        Commands::Join { host } => {
            let host_id = parse_peer_id(host).ok_or_else(|| format!("Invalid host id: {}", host))?;
            ListeningSession::create_listener(ctx, &host_id)?
        }
    };

    session.set_callback(Arc::new(LogCallback));

    let peer = session.peer();
    info!("Peer id: {}", peer.id());
    match session.invitation_url() {
        Some(url) => info!("Invitation: {}", url),
        None => info!("Invite others with: listen-node join {}", peer.id()),
    }

    session.subscribe(
        vec![StatePath::Listeners],
        Arc::new(|state: &ListeningState| {
            info!("Listeners: {:?}", state.listeners);
        }),
    );
    session.subscribe(
        vec![StatePath::Playlist, StatePath::Playback],
        Arc::new(|state: &ListeningState| {
            info!(
                "Now playing {:?} ({} in playlist, {})",
                state.playback.current_audio,
                state.playlist.len(),
                if state.playback.paused { "paused" } else { "playing" }
            );
        }),
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    session.close();

    // Let the close frames go out
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(())
}
