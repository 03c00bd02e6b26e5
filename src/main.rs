use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::signal;
use uuid::Uuid;

use playit::ipc::IpcClient;
use playit::library::PlaylistMetadata;
use playit::protocol::RecordingUpload;
use playit::{Config, Engine, EngineCommand, EngineLocation, EngineResponse, LoopMode};

#[derive(Parser)]
#[command(name = "playit", version, about = "Music player engine")]
struct Cli {
    /// Socket of the engine, overrides ipc.socket_path
    #[arg(long, global = true, env = "PLAYIT_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the engine until Ctrl+C
    Serve,
    /// Play a recording, or resume, or start the queue
    Play { id: Option<String> },
    Pause,
    Next,
    Previous,
    /// Jump to a position in the current recording
    Seek { seconds: f64 },
    Status,
    /// Show the queue, or append recordings to it
    Queue { ids: Vec<String> },
    /// Empty the queue
    Clear,
    Shuffle {
        #[arg(value_parser = parse_switch)]
        enabled: bool,
    },
    /// none, queue or recording
    Loop { mode: LoopMode },
    /// Look up a recording
    Metadata { id: String },
    /// Store an audio file for a recording
    Import { id: String, file: PathBuf },
    /// Save the stored audio file of a recording
    Export { id: String, file: PathBuf },
    Playlist { id: Uuid },
    Playlists,
    /// Create a playlist
    SavePlaylist { name: String, ids: Vec<String> },
    /// Permissions of this connection
    Permissions,
    /// Check that an engine is answering
    Ping,
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(format!("expected on or off, got '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(socket) = &cli.socket {
        config.ipc.socket_path = socket.display().to_string();
    }

    let command = match cli.command {
        Command::Serve => return serve(config).await,
        Command::Play { id } => EngineCommand::Play(id),
        Command::Pause => EngineCommand::Pause,
        Command::Next => EngineCommand::Next,
        Command::Previous => EngineCommand::Previous,
        Command::Seek { seconds } => EngineCommand::Seek(
            Duration::try_from_secs_f64(seconds).context("Seek position must be positive")?,
        ),
        Command::Status => EngineCommand::Status,
        Command::Queue { ids } if ids.is_empty() => EngineCommand::Queue(None),
        Command::Queue { ids } => EngineCommand::Queue(Some(ids)),
        Command::Clear => EngineCommand::ClearQueue,
        Command::Shuffle { enabled } => EngineCommand::ShuffleQueue(enabled),
        Command::Loop { mode } => EngineCommand::LoopMode(mode),
        Command::Metadata { id } => EngineCommand::RecordingMetadata(id),
        Command::Import { id, file } => {
            let contents = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            EngineCommand::SendRecording(RecordingUpload {
                id,
                recording: None,
                contents,
            })
        }
        Command::Export { id, file } => return export(&config, id, file).await,
        Command::Playlist { id } => EngineCommand::PlaylistMetadata(id),
        Command::Playlists => EngineCommand::Playlists,
        Command::SavePlaylist { name, ids } => {
            let id = Uuid::new_v4();
            EngineCommand::SetPlaylistMetadata(
                id,
                PlaylistMetadata {
                    id,
                    name,
                    recordings: ids,
                },
            )
        }
        Command::Permissions => EngineCommand::GetPermissions,
        Command::Ping => EngineCommand::None,
    };

    let responses = request(&config, command).await?;
    print_responses(&responses)
}

async fn request(config: &Config, command: EngineCommand) -> anyhow::Result<Vec<EngineResponse>> {
    let socket = config.socket_path();
    IpcClient::request(
        &socket,
        command,
        config.ipc.channel_capacity,
        config.request_timeout(),
    )
        .await
        .with_context(|| format!("No answer from the engine at {}", socket.display()))
}

fn print_responses(responses: &[EngineResponse]) -> anyhow::Result<()> {
    for response in responses {
        println!("{}", serde_json::to_string_pretty(response)?);
    }
    if let Some(EngineResponse::Nope(_, reason)) = responses
        .iter()
        .find(|response| matches!(response, EngineResponse::Nope(..)))
    {
        bail!("Engine refused: {}", reason);
    }
    Ok(())
}

async fn export(config: &Config, id: String, file: PathBuf) -> anyhow::Result<()> {
    let responses = request(config, EngineCommand::RecordingFile(id)).await?;

    for response in &responses {
        if let EngineResponse::RecordingFile(upload) = response {
            tokio::fs::write(&file, &upload.contents)
                .await
                .with_context(|| format!("Failed to write {}", file.display()))?;
            let title = upload
                .recording
                .as_ref()
                .map(|recording| format!("{} - {}", recording.artist_line(), recording.title))
                .unwrap_or_else(|| upload.id.clone());
            println!(
                "Saved {} ({} bytes) to {}",
                title,
                upload.contents.len(),
                file.display()
            );
            return Ok(());
        }
    }

    print_responses(&responses)?;
    bail!("The engine sent no audio file")
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let engine = Engine::create(config).await.context("Failed to start engine")?;

    if !matches!(engine.location(), EngineLocation::Hosting { .. }) {
        bail!(
            "An engine is already running on {}",
            engine.socket_path().display()
        );
    }

    let mut responses = engine.subscribe();
    log::info!("playit engine started on {}", engine.socket_path().display());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            response = responses.recv() => match response {
                Ok(EngineResponse::NowPlaying(id)) => log::info!("Now playing {}", id),
                Ok(EngineResponse::Stopped) => log::info!("Playback stopped"),
                Ok(other) => log::debug!("{:?}", other),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Missed {} engine events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    drop(engine);
    Ok(())
}
