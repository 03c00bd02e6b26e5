use std::collections::{BTreeSet, HashMap};

use crate::library::{Library, normalize_recording_id};
use crate::player::{FinishOutcome, Sequencer};
use crate::protocol::{
    ConnectionId, EngineCommand, EngineResponse, Permission, RecordingUpload,
};

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The application that owns the engine. Holds every permission.
    Local,
    Connection(ConnectionId),
}

/// Executes commands against the sequencer and library of a hosting engine.
pub struct CommandProcessor {
    sequencer: Sequencer,
    default_permissions: BTreeSet<Permission>,
    permissions: HashMap<ConnectionId, BTreeSet<Permission>>,
}

impl CommandProcessor {
    pub fn new(sequencer: Sequencer, default_permissions: Vec<Permission>) -> Self {
        Self {
            sequencer,
            default_permissions: default_permissions.into_iter().collect(),
            permissions: HashMap::new(),
        }
    }

    fn library(&self) -> &Library {
        self.sequencer.library()
    }

    pub fn connect(&mut self, id: ConnectionId) {
        self.permissions
            .insert(id, self.default_permissions.clone());
    }

    pub fn disconnect(&mut self, id: ConnectionId) {
        self.permissions.remove(&id);
    }

    pub fn permissions(&self, origin: Origin) -> Vec<Permission> {
        match origin {
            Origin::Local => Permission::ALL.to_vec(),
            Origin::Connection(id) => self
                .permissions
                .get(&id)
                .map(|granted| granted.iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    fn allowed(&self, origin: Origin, permission: Permission) -> bool {
        match origin {
            Origin::Local => true,
            Origin::Connection(id) => self
                .permissions
                .get(&id)
                .is_some_and(|granted| granted.contains(&permission)),
        }
    }

    /// Run `command` and return the replies for its origin.
    pub async fn handle(&mut self, origin: Origin, command: EngineCommand) -> Vec<EngineResponse> {
        log::debug!("{:?} -> {:?}", origin, command);

        if command.is_owner_only() && origin != Origin::Local {
            return vec![EngineResponse::nope(
                command,
                "only the engine owner may do this",
            )];
        }
        if let Some(permission) = Permission::required_for(&command)
            && !self.allowed(origin, permission)
        {
            return vec![EngineResponse::nope(
                command,
                format!("missing {} permission", permission),
            )];
        }

        match self.execute(origin, command.clone()).await {
            Ok(responses) => responses,
            Err(reason) => {
                log::debug!("Rejected {:?}: {}", command, reason);
                vec![EngineResponse::Nope(command, reason)]
            }
        }
    }

    async fn execute(
        &mut self,
        origin: Origin,
        command: EngineCommand,
    ) -> Result<Vec<EngineResponse>, String> {
        let sequencer = &self.sequencer;

        let responses = match command {
            EngineCommand::None | EngineCommand::Goodbye => vec![EngineResponse::Ok(command)],

            EngineCommand::Play(id) => {
                let playing = sequencer.play(id).await.map_err(|e| e.to_string())?;
                vec![
                    EngineResponse::NowPlaying(playing),
                    EngineResponse::Queue(sequencer.queue().await),
                ]
            }
            EngineCommand::Pause => {
                let paused = sequencer.pause().await.map_err(|e| e.to_string())?;
                vec![EngineResponse::NowPaused(paused)]
            }
            EngineCommand::Next => {
                let playing = sequencer.next().await.map_err(|e| e.to_string())?;
                vec![
                    EngineResponse::NowPlaying(playing),
                    EngineResponse::Queue(sequencer.queue().await),
                ]
            }
            EngineCommand::Previous => {
                let playing = sequencer.previous().await.map_err(|e| e.to_string())?;
                vec![
                    EngineResponse::NowPlaying(playing),
                    EngineResponse::Queue(sequencer.queue().await),
                ]
            }
            EngineCommand::Seek(position) => {
                let position = sequencer.seek(position).await.map_err(|e| e.to_string())?;
                vec![EngineResponse::Seek(position)]
            }
            EngineCommand::Position => {
                let position = sequencer.position().await.map_err(|e| e.to_string())?;
                vec![EngineResponse::CurrentTime(position)]
            }
            EngineCommand::Status => vec![EngineResponse::Status(sequencer.status().await)],

            EngineCommand::Queue(None) => vec![EngineResponse::Queue(sequencer.queue().await)],
            EngineCommand::Queue(Some(ids)) => {
                let missing = sequencer.add_queue(ids).await;
                let mut responses = Vec::with_capacity(2);
                if !missing.is_empty() {
                    responses.push(EngineResponse::Missing(missing));
                }
                responses.push(EngineResponse::Queue(sequencer.queue().await));
                responses
            }
            EngineCommand::ShuffleQueue(enable) => {
                sequencer.set_shuffle(enable).await;
                vec![
                    EngineResponse::Shuffle(enable),
                    EngineResponse::Queue(sequencer.queue().await),
                ]
            }
            EngineCommand::ClearQueue => {
                sequencer.clear_queue().await;
                vec![EngineResponse::Queue(Vec::new())]
            }
            EngineCommand::LoopMode(mode) => {
                sequencer.set_loop_mode(mode).await;
                vec![EngineResponse::LoopMode(mode)]
            }

            EngineCommand::RecordingMetadata(id) => {
                let metadata = self
                    .library()
                    .recording_metadata(&id)
                    .await
                    .map_err(|e| e.to_string())?;
                vec![EngineResponse::RecordingMetadata(metadata)]
            }
            EngineCommand::RecordingFile(id) => {
                let library = self.library();
                let id = normalize_recording_id(&id).map_err(|e| e.to_string())?;
                let contents = library
                    .read_recording_file(&id)
                    .await
                    .map_err(|e| e.to_string())?;
                let metadata = library
                    .recording_metadata(&id)
                    .await
                    .map_err(|e| e.to_string())?;
                vec![EngineResponse::RecordingFile(RecordingUpload {
                    id,
                    recording: Some(metadata.recording),
                    contents,
                })]
            }
            EngineCommand::SendRecording(upload) => {
                let metadata = self
                    .library()
                    .import_recording(upload)
                    .await
                    .map_err(|e| e.to_string())?;
                vec![EngineResponse::RecordingMetadata(metadata)]
            }

            EngineCommand::PlaylistMetadata(id) => {
                let playlist = self.library().playlist(id).await.map_err(|e| e.to_string())?;
                vec![EngineResponse::PlaylistMetadata(playlist)]
            }
            EngineCommand::SetPlaylistMetadata(id, mut playlist) => {
                playlist.id = id;
                self.library()
                    .set_playlist(&playlist)
                    .await
                    .map_err(|e| e.to_string())?;
                vec![EngineResponse::PlaylistMetadata(playlist)]
            }
            EngineCommand::Playlists => {
                let playlists = self.library().playlists().await.map_err(|e| e.to_string())?;
                vec![EngineResponse::Playlists(playlists)]
            }

            EngineCommand::SetVolume(volume) => {
                let volume = sequencer.set_volume(volume).map_err(|e| e.to_string())?;
                vec![EngineResponse::Volume(volume)]
            }

            EngineCommand::GetPermissions => {
                vec![EngineResponse::Permissions(self.permissions(origin))]
            }
            EngineCommand::SetPermissions(target, ref granted) => {
                let Some(current) = self.permissions.get_mut(&target) else {
                    return Err(format!("no connection {}", target));
                };
                *current = granted.iter().copied().collect();
                log::info!("Connection {} now has {:?}", target, granted);
                vec![EngineResponse::Ok(command)]
            }
        };

        Ok(responses)
    }

    /// The current recording ended: move on and describe the new state.
    /// The replies are meant for every listener.
    pub async fn on_finished(&mut self) -> Vec<EngineResponse> {
        let first = match self.sequencer.on_finished().await {
            Ok(FinishOutcome::Ignored) => return Vec::new(),
            Ok(FinishOutcome::Playing(playing)) => EngineResponse::NowPlaying(playing),
            Ok(FinishOutcome::Stopped) => EngineResponse::Stopped,
            Err(e) => {
                log::warn!("Playback stopped: {}", e);
                EngineResponse::Stopped
            }
        };
        vec![first, EngineResponse::Queue(self.sequencer.queue().await)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::tests::wav_bytes;
    use crate::audio::{NullSink, PcmSink, Player, PlayerEvent};
    use crate::library::PlaylistMetadata;
    use crate::library::database::tests::{RECORDING_A, RECORDING_B, open_library};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn processor(dir: &std::path::Path, defaults: Vec<Permission>) -> CommandProcessor {
        processor_with_events(dir, defaults).await.0
    }

    async fn processor_with_events(
        dir: &std::path::Path,
        defaults: Vec<Permission>,
    ) -> (CommandProcessor, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (library, _) = open_library(dir);
        library
            .set_recording_file(RECORDING_A, Some(wav_bytes(8000, 2, 4000)))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let player = Player::start(
            || Ok(Box::new(NullSink::new(8000, 2, 80)) as Box<dyn PcmSink>),
            tx,
        )
        .unwrap();
        (
            CommandProcessor::new(Sequencer::new(library, player, 10), defaults),
            rx,
        )
    }

    #[tokio::test]
    async fn local_owner_can_do_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path(), vec![]).await;

        let responses = processor
            .handle(Origin::Local, EngineCommand::Play(Some(RECORDING_A.into())))
            .await;
        assert_eq!(
            responses,
            vec![
                EngineResponse::NowPlaying(RECORDING_A.into()),
                EngineResponse::Queue(vec![]),
            ]
        );

        let responses = processor
            .handle(Origin::Local, EngineCommand::SetVolume(0.25))
            .await;
        assert_eq!(responses, vec![EngineResponse::Volume(0.25)]);

        let responses = processor
            .handle(Origin::Local, EngineCommand::GetPermissions)
            .await;
        assert_eq!(
            responses,
            vec![EngineResponse::Permissions(Permission::ALL.to_vec())]
        );
    }

    #[tokio::test]
    async fn connections_need_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path(), vec![Permission::Queue]).await;
        let id = Uuid::new_v4();
        processor.connect(id);
        let remote = Origin::Connection(id);

        let responses = processor.handle(remote, EngineCommand::Next).await;
        assert!(matches!(
            responses.as_slice(),
            [EngineResponse::Nope(EngineCommand::Next, reason)] if reason.contains("control")
        ));

        let responses = processor
            .handle(remote, EngineCommand::SetVolume(1.0))
            .await;
        assert!(matches!(responses.as_slice(), [EngineResponse::Nope(..)]));

        let responses = processor
            .handle(
                remote,
                EngineCommand::Queue(Some(vec![RECORDING_A.into(), RECORDING_B.into()])),
            )
            .await;
        assert_eq!(
            responses,
            vec![
                EngineResponse::Missing(vec![RECORDING_B.into()]),
                EngineResponse::Queue(vec![RECORDING_A.into()]),
            ]
        );

        // the owner grants control
        let responses = processor
            .handle(
                Origin::Local,
                EngineCommand::SetPermissions(id, vec![Permission::Control]),
            )
            .await;
        assert!(matches!(responses.as_slice(), [EngineResponse::Ok(_)]));
        assert_eq!(processor.permissions(remote), vec![Permission::Control]);

        let responses = processor.handle(remote, EngineCommand::Next).await;
        assert_eq!(responses[0], EngineResponse::NowPlaying(RECORDING_A.into()));

        processor.disconnect(id);
        assert!(processor.permissions(remote).is_empty());
    }

    #[tokio::test]
    async fn failures_become_nope() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path(), Permission::ALL.to_vec()).await;

        let responses = processor.handle(Origin::Local, EngineCommand::Pause).await;
        assert!(matches!(
            responses.as_slice(),
            [EngineResponse::Nope(EngineCommand::Pause, reason)] if reason == "nothing is playing"
        ));

        let responses = processor
            .handle(
                Origin::Local,
                EngineCommand::SetPermissions(Uuid::new_v4(), vec![]),
            )
            .await;
        assert!(matches!(responses.as_slice(), [EngineResponse::Nope(..)]));
    }

    #[tokio::test]
    async fn transfers_and_playlists() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path(), Permission::ALL.to_vec()).await;

        let responses = processor
            .handle(Origin::Local, EngineCommand::RecordingFile(RECORDING_A.into()))
            .await;
        let [EngineResponse::RecordingFile(upload)] = responses.as_slice() else {
            panic!("unexpected {:?}", responses);
        };
        assert_eq!(upload.id, RECORDING_A);
        assert_eq!(upload.contents, wav_bytes(8000, 2, 4000));

        let responses = processor
            .handle(
                Origin::Local,
                EngineCommand::SendRecording(RecordingUpload {
                    id: RECORDING_B.into(),
                    recording: None,
                    contents: wav_bytes(8000, 1, 100),
                }),
            )
            .await;
        assert!(matches!(
            responses.as_slice(),
            [EngineResponse::RecordingMetadata(metadata)] if metadata.audio_file_hash.is_some()
        ));

        let playlist_id = Uuid::new_v4();
        let playlist = PlaylistMetadata {
            id: Uuid::nil(),
            name: "Mix".into(),
            recordings: vec![RECORDING_A.into(), RECORDING_B.into()],
        };
        processor
            .handle(
                Origin::Local,
                EngineCommand::SetPlaylistMetadata(playlist_id, playlist),
            )
            .await;

        let responses = processor
            .handle(Origin::Local, EngineCommand::PlaylistMetadata(playlist_id))
            .await;
        assert!(matches!(
            responses.as_slice(),
            [EngineResponse::PlaylistMetadata(stored)] if stored.id == playlist_id && stored.name == "Mix"
        ));
    }

    #[tokio::test]
    async fn finishing_the_queue_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, mut events) = processor_with_events(dir.path(), vec![]).await;

        processor
            .handle(Origin::Local, EngineCommand::Play(Some(RECORDING_A.into())))
            .await;
        // Still playing, so there is nothing to announce.
        assert!(processor.on_finished().await.is_empty());

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(PlayerEvent::Finished));
        assert_eq!(
            processor.on_finished().await,
            vec![EngineResponse::Stopped, EngineResponse::Queue(vec![])]
        );
    }
}
