//! Pulse Meet CLI
//!
//! Startet oder betritt einen Raum mit simulierten Geräten, gibt die Events
//! des Anrufs aus und beendet ihn mit Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulse_meet::{
    CallConfig, CallEngine, CallEvent, RoomId, SyntheticDevices, WebRtcTransportFactory,
    WsSignalingClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Two-party P2P video calls", long_about = None)]
struct Args {
    /// Config file (default: config.json in the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signaling relay URL (ws:// or wss://), overrides the config
    #[arg(short, long)]
    signaling: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a new room and wait for the other participant
    Start,
    /// Join an existing room
    Join {
        /// Room id shared by the other participant
        room: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    pulse_meet::init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CallConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CallConfig::load_default().context("Failed to load default config")?,
    };
    if let Some(url) = args.signaling {
        config.signaling_url = Some(url);
    }

    let url = config
        .signaling_url
        .clone()
        .context("No signaling relay configured (use --signaling or PULSE_SIGNALING_URL)")?;
    let signaling = WsSignalingClient::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to signaling relay {url}"))?;

    let engine = CallEngine::new(
        config,
        Arc::new(SyntheticDevices::new().with_frames()),
        Arc::new(WebRtcTransportFactory::new()),
        Arc::new(signaling),
    )?;
    let mut events = engine.subscribe();

    match args.command {
        Command::Start => {
            let room = engine.start_call().await?;
            println!("Room id: {room}");
            println!("Share it with the other participant: pulse-meet join {room}");
        }
        Command::Join { room } => {
            let room = RoomId::parse(&room)?;
            engine.join_call(room).await?;
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let report = engine.end_call().await?;
                println!("Call ended, {} track(s) stopped", report.stopped_tracks);
                break;
            }
            event = events.recv() => match event {
                Ok(CallEvent::Elapsed(elapsed)) => {
                    let secs = elapsed.as_secs();
                    println!("{:02}:{:02}", secs / 60, secs % 60);
                }
                Ok(CallEvent::CallEnded(report)) => {
                    println!("Call ended ({:?})", report.outcome);
                    break;
                }
                Ok(event) => println!("{event:?}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} call events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}
