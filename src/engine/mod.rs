//! The engine an application embeds.
//!
//! The first engine on a socket hosts: it owns the audio output and the
//! library and serves other processes over IPC. Later engines find the socket
//! taken and relay their commands to the host instead.

mod processor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{Player, PlayerEvent};
use crate::config::{Config, ConfigError};
use crate::ipc::{IpcClient, IpcError, IpcServer, ServerEvent};
use crate::library::{
    Library, LibraryError, MetadataProvider, MusicBrainzClient, OfflineProvider,
};
use crate::player::Sequencer;
use crate::protocol::{ConnectionId, EngineCommand, EngineResponse};

pub use processor::{CommandProcessor, Origin};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("audio output unavailable: {0:#}")]
    Audio(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionStatus {
    /// Hosting, or relaying to the engine on the configured socket.
    ConnectedLocal,
    ConnectedRemote,
    Disconnected,
}

pub enum EngineLocation {
    Disconnected,
    Hosting {
        server: IpcServer,
        processor: JoinHandle<()>,
    },
    Local {
        client: IpcClient,
        relay: JoinHandle<()>,
    },
    Remote {
        client: IpcClient,
        relay: JoinHandle<()>,
    },
}

impl EngineLocation {
    fn abort(&self) {
        match self {
            EngineLocation::Disconnected => {}
            EngineLocation::Hosting { processor, .. } => processor.abort(),
            EngineLocation::Local { relay, .. } | EngineLocation::Remote { relay, .. } => {
                relay.abort()
            }
        }
    }
}

pub struct Engine {
    config: Config,
    library: Library,
    location: EngineLocation,
    commands: broadcast::Sender<EngineCommand>,
    responses: broadcast::Sender<EngineResponse>,
}

impl Engine {
    /// Open the library and connect to the configured socket, hosting if
    /// nobody else does.
    pub async fn create(config: Config) -> Result<Engine, EngineError> {
        config.validate()?;

        let provider: Arc<dyn MetadataProvider> = if config.metadata.enabled {
            Arc::new(MusicBrainzClient::new(&config.metadata)?)
        } else {
            Arc::new(OfflineProvider)
        };
        let library = Library::open(&config.library_root(), provider)?;

        let capacity = config.ipc.channel_capacity.max(1);
        let (commands, _) = broadcast::channel::<EngineCommand>(capacity);
        let (responses, _) = broadcast::channel::<EngineResponse>(capacity);

        let mut engine = Engine {
            config,
            library,
            location: EngineLocation::Disconnected,
            commands,
            responses,
        };
        engine.connect_to_local().await?;

        Ok(engine)
    }

    /// Sender for commands from the owning application.
    pub fn command_sender(&self) -> broadcast::Sender<EngineCommand> {
        self.commands.clone()
    }

    /// Responses to the owner's commands, plus playback notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineResponse> {
        self.responses.subscribe()
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn location(&self) -> &EngineLocation {
        &self.location
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    pub fn connection_status(&self) -> EngineConnectionStatus {
        match &self.location {
            EngineLocation::Disconnected => EngineConnectionStatus::Disconnected,
            EngineLocation::Hosting { server, processor } => {
                if server.is_running() && !processor.is_finished() {
                    EngineConnectionStatus::ConnectedLocal
                } else {
                    EngineConnectionStatus::Disconnected
                }
            }
            EngineLocation::Local { relay, .. } => {
                if relay.is_finished() {
                    EngineConnectionStatus::Disconnected
                } else {
                    EngineConnectionStatus::ConnectedLocal
                }
            }
            EngineLocation::Remote { relay, .. } => {
                if relay.is_finished() {
                    EngineConnectionStatus::Disconnected
                } else {
                    EngineConnectionStatus::ConnectedRemote
                }
            }
        }
    }

    fn replace_location(&mut self, location: EngineLocation) {
        let previous = std::mem::replace(&mut self.location, location);
        previous.abort();
    }

    /// Stop hosting or relaying.
    pub fn disconnect(&mut self) {
        self.replace_location(EngineLocation::Disconnected);
    }

    /// Host on the configured socket, or relay to whoever already does.
    pub async fn connect_to_local(&mut self) -> Result<(), EngineError> {
        let local = matches!(
            self.location,
            EngineLocation::Hosting { .. } | EngineLocation::Local { .. }
        );
        if local && self.connection_status() == EngineConnectionStatus::ConnectedLocal {
            return Ok(());
        }

        // Free the socket before binding it again.
        self.disconnect();

        let socket = self.config.socket_path();
        let location = match self.host(&socket).await {
            Ok(location) => location,
            Err(EngineError::Ipc(IpcError::AddressInUse(_))) => {
                log::info!(
                    "An engine is already running on {}, relaying to it",
                    socket.display()
                );
                let (client, relay) = self.relay(&socket).await?;
                EngineLocation::Local { client, relay }
            }
            Err(e) => return Err(e),
        };

        self.replace_location(location);
        Ok(())
    }

    /// Relay to the engine listening on `path`.
    pub async fn connect_to_remote(&mut self, path: &Path) -> Result<(), EngineError> {
        let (client, relay) = self.relay(path).await?;
        self.replace_location(EngineLocation::Remote { client, relay });
        log::info!("Relaying to remote engine at {}", path.display());
        Ok(())
    }

    async fn host(&self, socket: &Path) -> Result<EngineLocation, EngineError> {
        let (server, server_events, server_responses) =
            IpcServer::bind(socket, self.config.ipc.channel_capacity).await?;

        let (player_tx, player_rx) = mpsc::unbounded_channel();
        let player =
            Player::from_settings(&self.config.audio, player_tx).map_err(EngineError::Audio)?;
        let sequencer = Sequencer::new(
            self.library.clone(),
            player,
            self.config.engine.history_limit,
        );
        let permissions = self.config.engine.default_permissions()?;
        let processor = CommandProcessor::new(sequencer, permissions);

        let processor = tokio::spawn(run_host(
            processor,
            server_events,
            server_responses,
            self.commands.subscribe(),
            self.responses.clone(),
            player_rx,
        ));

        log::info!("Hosting engine on {}", socket.display());
        Ok(EngineLocation::Hosting { server, processor })
    }

    async fn relay(&self, path: &Path) -> Result<(IpcClient, JoinHandle<()>), EngineError> {
        let (client, responses, commands) =
            IpcClient::connect(path, self.config.ipc.channel_capacity).await?;
        let relay = tokio::spawn(run_relay(
            responses,
            commands,
            self.commands.subscribe(),
            self.responses.clone(),
        ));
        Ok((client, relay))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.location.abort();
    }
}

async fn run_host(
    mut processor: CommandProcessor,
    mut server_events: mpsc::Receiver<ServerEvent>,
    server_responses: broadcast::Sender<(EngineResponse, ConnectionId)>,
    mut local_commands: broadcast::Receiver<EngineCommand>,
    local_responses: broadcast::Sender<EngineResponse>,
    mut player_events: mpsc::UnboundedReceiver<PlayerEvent>,
) {
    loop {
        tokio::select! {
            command = local_commands.recv() => match command {
                Ok(command) => {
                    for response in processor.handle(Origin::Local, command).await {
                        let _ = local_responses.send(response);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Dropped {} local commands", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = server_events.recv() => match event {
                Some(ServerEvent::Connected(id)) => processor.connect(id),
                Some(ServerEvent::Disconnected(id)) => processor.disconnect(id),
                Some(ServerEvent::Command(command, id)) => {
                    for response in processor.handle(Origin::Connection(id), command).await {
                        let _ = server_responses.send((response, id));
                    }
                }
                None => break,
            },
            Some(PlayerEvent::Finished) = player_events.recv() => {
                for response in processor.on_finished().await {
                    let _ = local_responses.send(response.clone());
                    let _ = server_responses.send((response, Uuid::nil()));
                }
            }
        }
    }

    log::info!("Command processor stopped");
}

async fn run_relay(
    mut responses: mpsc::Receiver<EngineResponse>,
    commands: mpsc::Sender<EngineCommand>,
    mut local_commands: broadcast::Receiver<EngineCommand>,
    local_responses: broadcast::Sender<EngineResponse>,
) {
    loop {
        tokio::select! {
            response = responses.recv() => match response {
                Some(response) => {
                    let _ = local_responses.send(response);
                }
                None => {
                    log::warn!("Lost the connection to the engine");
                    break;
                }
            },
            command = local_commands.recv() => match command {
                // The output belongs to the hosting process.
                Ok(command @ EngineCommand::SetVolume(_)) => {
                    let _ = local_responses
                        .send(EngineResponse::nope(command, "no local output while relaying"));
                }
                Ok(command) => {
                    if commands.send(command).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Dropped {} local commands", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.library.root = dir.join("library").display().to_string();
        config.ipc.socket_path = dir.join("playit.sock").display().to_string();
        config.audio.backend = "null".into();
        config.metadata.enabled = false;
        config
    }

    async fn expect(
        responses: &mut broadcast::Receiver<EngineResponse>,
        wanted: impl Fn(&EngineResponse) -> bool,
    ) -> EngineResponse {
        loop {
            let response = tokio::time::timeout(Duration::from_secs(5), responses.recv())
                .await
                .unwrap()
                .unwrap();
            if wanted(&response) {
                return response;
            }
        }
    }

    #[tokio::test]
    async fn first_engine_hosts_second_relays() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let host = Engine::create(config.clone()).await.unwrap();
        assert!(matches!(host.location(), EngineLocation::Hosting { .. }));
        assert_eq!(
            host.connection_status(),
            EngineConnectionStatus::ConnectedLocal
        );

        let relay = Engine::create(config).await.unwrap();
        assert!(matches!(relay.location(), EngineLocation::Local { .. }));

        let mut responses = relay.subscribe();
        relay
            .command_sender()
            .send(EngineCommand::ShuffleQueue(true))
            .unwrap();
        let response = expect(&mut responses, |r| {
            matches!(r, EngineResponse::Shuffle(_) | EngineResponse::Nope(..))
        })
        .await;
        assert_eq!(response, EngineResponse::Shuffle(true));

        relay
            .command_sender()
            .send(EngineCommand::SetVolume(0.5))
            .unwrap();
        let response = expect(&mut responses, |r| matches!(r, EngineResponse::Nope(..))).await;
        assert!(matches!(response, EngineResponse::Nope(EngineCommand::SetVolume(_), _)));
    }

    #[tokio::test]
    async fn owner_commands_are_answered_locally() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::create(test_config(dir.path())).await.unwrap();

        let mut responses = engine.subscribe();
        engine
            .command_sender()
            .send(EngineCommand::SetVolume(2.0))
            .unwrap();
        let response = expect(&mut responses, |_| true).await;
        assert_eq!(response, EngineResponse::Volume(1.0));
    }

    #[tokio::test]
    async fn relay_notices_host_going_away() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let host = Engine::create(config.clone()).await.unwrap();
        let relay = Engine::create(config).await.unwrap();
        drop(host);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while relay.connection_status() != EngineConnectionStatus::Disconnected {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn remote_engines_are_explicit_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let host = Engine::create(test_config(dir.path())).await.unwrap();

        let other = tempfile::tempdir().unwrap();
        let mut engine = Engine::create(test_config(other.path())).await.unwrap();
        engine.connect_to_remote(&host.socket_path()).await.unwrap();
        assert_eq!(
            engine.connection_status(),
            EngineConnectionStatus::ConnectedRemote
        );

        // switching back hosts on its own socket again
        engine.connect_to_local().await.unwrap();
        assert!(matches!(engine.location(), EngineLocation::Hosting { .. }));

        assert!(
            engine
                .connect_to_remote(&other.path().join("nobody.sock"))
                .await
                .is_err()
        );
    }
}
