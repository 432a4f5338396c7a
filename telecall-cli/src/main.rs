//! Telecall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telecall_core::prelude::*;
use telecall_core::{
    CandidateMode, ChatOrigin, ClientId, DeviceMediaSource, DiagnosticLevel, TransportConfig,
    WebRtcPeerFactory, WebSocketTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file; missing fields fall back to defaults
    #[arg(short, long, env = "TELECALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and stay in the call until /quit or Ctrl-C
    Join {
        /// Room identifier shared with the other party
        room: String,

        /// Party tag announced to the relay (e.g. "doctor", "patient")
        #[arg(short, long, default_value = "guest")]
        tag: String,

        /// Relay WebSocket URL
        #[arg(long, env = "TELECALL_RELAY_URL")]
        relay: Option<String>,

        /// Client identifier; random when omitted
        #[arg(long)]
        client_id: Option<String>,

        /// Join without a camera
        #[arg(long)]
        no_video: bool,

        /// Join without a microphone
        #[arg(long)]
        no_audio: bool,

        /// Send candidates as they are gathered
        #[arg(long)]
        trickle: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

/// Command-line overrides applied on top of the loaded configuration
#[derive(Debug, Default)]
struct Overrides {
    relay: Option<String>,
    no_video: bool,
    no_audio: bool,
    trickle: bool,
}

impl Overrides {
    fn apply(self, config: &mut CallConfig) {
        if let Some(relay) = self.relay {
            config.signaling.relay_url = relay;
        }
        if self.no_video {
            config.media.video = false;
        }
        if self.no_audio {
            config.media.audio = false;
        }
        if self.trickle {
            config.negotiation.candidate_mode = CandidateMode::Trickle;
        }
    }
}

/// A line typed by the user during a call
#[derive(Debug, PartialEq, Eq)]
enum Input {
    ToggleVideo,
    ToggleAudio,
    Quit,
    Chat(String),
    Nothing,
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        "" => Input::Nothing,
        "/video" => Input::ToggleVideo,
        "/audio" => Input::ToggleAudio,
        "/quit" | "/exit" => Input::Quit,
        text => Input::Chat(text.to_string()),
    }
}

fn load_config(path: Option<&Path>) -> Result<CallConfig> {
    let Some(path) = path else {
        return Ok(CallConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telecall=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Join {
            room,
            tag,
            relay,
            client_id,
            no_video,
            no_audio,
            trickle,
        } => {
            Overrides {
                relay,
                no_video,
                no_audio,
                trickle,
            }
            .apply(&mut config);
            handle_join(config, &room, &tag, client_id).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn handle_join(
    config: CallConfig,
    room: &str,
    tag: &str,
    client_id: Option<String>,
) -> Result<()> {
    println!("Joining room {} as {} via {}", room, tag, config.signaling.relay_url);
    println!(
        "   Video: {} | Audio: {}",
        config.media.video, config.media.audio
    );

    let deps = CallDependencies {
        transport: Arc::new(WebSocketTransport::new(TransportConfig {
            url: config.signaling.relay_url.clone(),
        })),
        peers: Arc::new(WebRtcPeerFactory::new(
            config.negotiation.ice_servers.clone(),
        )),
        media: Arc::new(DeviceMediaSource::default()),
    };

    let call = match client_id {
        Some(id) => CallSession::spawn_with_id(config, deps, ClientId::new(id)),
        None => CallSession::spawn(config, deps),
    };
    let mut events = call.events();

    call.join_room(RoomId::new(room), PartyTag::new(tag))
        .await
        .context("joining room")?;
    println!("Waiting for the other party. Type to chat; /video, /audio, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(CallEvent::Failed(reason)) => {
                        println!("Call failed: {}", reason);
                        break;
                    }
                    Ok(CallEvent::StateChanged { to: SessionState::Closed, .. }) => break,
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} call events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Quit => break,
                    Input::Nothing => {}
                    Input::ToggleVideo => match call.toggle_local_video().await {
                        Ok(enabled) => println!("Camera {}", on_off(enabled)),
                        Err(e) => println!("Cannot toggle camera: {}", e),
                    },
                    Input::ToggleAudio => match call.toggle_local_audio().await {
                        Ok(enabled) => println!("Microphone {}", on_off(enabled)),
                        Err(e) => println!("Cannot toggle microphone: {}", e),
                    },
                    Input::Chat(text) => {
                        if let Err(e) = call.send_chat(text).await {
                            println!("Message not sent: {}", e);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    call.end_call().await;
    println!("Call ended");
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged { from, to } => {
            tracing::debug!(?from, ?to, "state changed");
            println!("[{:?}]", to);
        }
        CallEvent::RoleAssigned(role) => println!("Peer present, negotiating as {:?}", role),
        CallEvent::RemoteMediaAvailable(remote) => println!(
            "Remote media: audio={} video={}",
            remote.has(MediaKind::Audio),
            remote.has(MediaKind::Video)
        ),
        CallEvent::RemoteMediaToggled { kind, enabled } => {
            println!("Peer turned {} {}", kind, on_off(*enabled));
        }
        CallEvent::Chat(message) => {
            if message.origin == ChatOrigin::Remote {
                println!("<{}> {}", message.timestamp.format("%H:%M"), message.text);
            }
        }
        CallEvent::ChannelStatus(status) => println!("Relay: {:?}", status),
        CallEvent::Diagnostic(diagnostic) => match diagnostic.level {
            DiagnosticLevel::Info => tracing::info!("{}", diagnostic.message),
            DiagnosticLevel::Warning => tracing::warn!("{}", diagnostic.message),
            DiagnosticLevel::Error => tracing::error!("{}", diagnostic.message),
        },
        CallEvent::Failed(reason) => println!("Call failed: {}", reason),
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_input_commands_and_chat() {
        assert_eq!(parse_input("/video"), Input::ToggleVideo);
        assert_eq!(parse_input(" /audio "), Input::ToggleAudio);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("   "), Input::Nothing);
        assert_eq!(
            parse_input("how are you feeling?"),
            Input::Chat("how are you feeling?".to_string())
        );
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let mut config = CallConfig::default();
        Overrides {
            relay: Some("wss://relay.example.org/ws".to_string()),
            no_video: true,
            no_audio: false,
            trickle: true,
        }
        .apply(&mut config);

        assert_eq!(config.signaling.relay_url, "wss://relay.example.org/ws");
        assert!(!config.media.video);
        assert!(config.media.audio);
        assert_eq!(config.negotiation.candidate_mode, CandidateMode::Trickle);
    }

    #[test]
    fn test_missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.recovery.max_peer_reconnects, 3);
    }

    #[test]
    fn test_cli_parses_join() {
        let cli = Cli::try_parse_from([
            "telecall",
            "join",
            "R1",
            "--tag",
            "doctor",
            "--relay",
            "ws://localhost:9000/ws",
            "--no-video",
        ])
        .unwrap();
        match cli.command {
            Commands::Join {
                room,
                tag,
                relay,
                no_video,
                ..
            } => {
                assert_eq!(room, "R1");
                assert_eq!(tag, "doctor");
                assert_eq!(relay.as_deref(), Some("ws://localhost:9000/ws"));
                assert!(no_video);
            }
            Commands::Config => panic!("expected join"),
        }
    }
}
