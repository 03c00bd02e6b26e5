//! Messages exchanged between an engine and its clients.
//!
//! Both directions are adjacently tagged JSON (`{"type": "Play", "data": ...}`)
//! framed as one document per line, see [`crate::ipc::codec`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::library::{PlaylistMetadata, Recording, RecordingMetadata};

/// Identifies one IPC connection. The nil id addresses every connection.
pub type ConnectionId = Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    None,
    LoopQueue,
    LoopRecording,
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LoopMode::None),
            "queue" | "loopqueue" => Ok(LoopMode::LoopQueue),
            "recording" | "song" | "looprecording" => Ok(LoopMode::LoopRecording),
            other => Err(format!("unknown loop mode '{}'", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    /// Transport control: play, pause, skip, seek, loop and shuffle modes.
    Control,
    /// Adding to and clearing the queue.
    Queue,
    /// Editing playlists.
    Playlist,
    /// Uploading and downloading audio files.
    Transfer,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::Control,
        Permission::Queue,
        Permission::Playlist,
        Permission::Transfer,
    ];

    pub fn required_for(command: &EngineCommand) -> Option<Permission> {
        command.required_permission()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Control => "control",
            Permission::Queue => "queue",
            Permission::Playlist => "playlist",
            Permission::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "control" => Ok(Permission::Control),
            "queue" => Ok(Permission::Queue),
            "playlist" => Ok(Permission::Playlist),
            "transfer" => Ok(Permission::Transfer),
            other => Err(format!("unknown permission '{}'", other)),
        }
    }
}

/// An audio file together with the recording it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordingUpload {
    pub id: String,
    /// Metadata to store with the file. When absent the engine looks it up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<Recording>,
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub now_playing: Option<String>,
    pub paused: bool,
    pub position: Duration,
    pub volume: f32,
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub queue_length: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum EngineCommand {
    None,
    Goodbye,

    Play(Option<String>),
    Pause,

    Next,
    Previous,

    Seek(Duration),
    Position,
    Status,

    Queue(Option<Vec<String>>),
    ShuffleQueue(bool),
    ClearQueue,

    LoopMode(LoopMode),

    RecordingMetadata(String),
    RecordingFile(String),
    SendRecording(RecordingUpload),

    PlaylistMetadata(Uuid),
    SetPlaylistMetadata(Uuid, PlaylistMetadata),
    Playlists,

    SetVolume(f32),

    GetPermissions,
    SetPermissions(Uuid, Vec<Permission>),
}

impl EngineCommand {
    /// Permission a connection must hold to run this command, `None` for
    /// read-only commands.
    pub fn required_permission(&self) -> Option<Permission> {
        match self {
            EngineCommand::Play(_)
            | EngineCommand::Pause
            | EngineCommand::Next
            | EngineCommand::Previous
            | EngineCommand::Seek(_)
            | EngineCommand::ShuffleQueue(_)
            | EngineCommand::LoopMode(_) => Some(Permission::Control),

            EngineCommand::Queue(Some(_)) | EngineCommand::ClearQueue => Some(Permission::Queue),

            EngineCommand::SetPlaylistMetadata(..) => Some(Permission::Playlist),

            EngineCommand::RecordingFile(_) | EngineCommand::SendRecording(_) => {
                Some(Permission::Transfer)
            }

            EngineCommand::None
            | EngineCommand::Goodbye
            | EngineCommand::Position
            | EngineCommand::Status
            | EngineCommand::Queue(None)
            | EngineCommand::RecordingMetadata(_)
            | EngineCommand::PlaylistMetadata(_)
            | EngineCommand::Playlists
            | EngineCommand::SetVolume(_)
            | EngineCommand::GetPermissions
            | EngineCommand::SetPermissions(..) => None,
        }
    }

    /// Commands only the in-process owner of the engine may issue.
    pub fn is_owner_only(&self) -> bool {
        matches!(
            self,
            EngineCommand::SetVolume(_) | EngineCommand::SetPermissions(..)
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum EngineResponse {
    /// First message on every connection, carries the connection's id.
    Welcome(ConnectionId),

    Ok(EngineCommand),
    Nope(EngineCommand, String),

    NowPlaying(String),
    NowPaused(String),
    Stopped,

    Seek(Duration),
    CurrentTime(Duration),
    Status(PlayerStatus),

    Queue(Vec<String>),
    /// Recordings that could not be queued because no audio file is stored.
    Missing(Vec<String>),
    Shuffle(bool),

    LoopMode(LoopMode),

    RecordingMetadata(RecordingMetadata),
    RecordingFile(RecordingUpload),

    PlaylistMetadata(PlaylistMetadata),
    Playlists(Vec<PlaylistMetadata>),

    Volume(f32),

    Permissions(Vec<Permission>),
}

impl EngineResponse {
    pub fn nope(command: EngineCommand, reason: impl Into<String>) -> Self {
        EngineResponse::Nope(command, reason.into())
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_are_adjacently_tagged() {
        let value = serde_json::to_value(EngineCommand::Play(Some("abc".into()))).unwrap();
        assert_eq!(value, json!({"type": "Play", "data": "abc"}));

        let value = serde_json::to_value(EngineCommand::Pause).unwrap();
        assert_eq!(value, json!({"type": "Pause"}));

        let parsed: EngineCommand =
            serde_json::from_str(r#"{"type":"Queue","data":["a","b"]}"#).unwrap();
        assert_eq!(
            parsed,
            EngineCommand::Queue(Some(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn nope_carries_the_rejected_command() {
        let response = EngineResponse::nope(EngineCommand::Next, "queue is empty");
        let text = serde_json::to_string(&response).unwrap();
        let back: EngineResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(back, response);
        assert!(text.contains("queue is empty"));
    }

    #[test]
    fn upload_contents_travel_as_base64() {
        let upload = RecordingUpload {
            id: "id".into(),
            recording: None,
            contents: vec![0, 1, 2, 250],
        };
        let value = serde_json::to_value(&upload).unwrap();
        assert_eq!(value["contents"], json!("AAEC+g=="));
        assert!(value.get("recording").is_none());

        let back: RecordingUpload = serde_json::from_value(value).unwrap();
        assert_eq!(back.contents, vec![0, 1, 2, 250]);
    }

    #[test]
    fn permission_mapping() {
        assert_eq!(
            EngineCommand::Next.required_permission(),
            Some(Permission::Control)
        );
        assert_eq!(EngineCommand::Queue(None).required_permission(), None);
        assert_eq!(
            EngineCommand::Queue(Some(vec![])).required_permission(),
            Some(Permission::Queue)
        );
        assert_eq!(
            EngineCommand::RecordingFile("x".into()).required_permission(),
            Some(Permission::Transfer)
        );
        assert!(EngineCommand::SetVolume(0.5).is_owner_only());
        assert!(!EngineCommand::Status.is_owner_only());
    }

    #[test]
    fn parses_names_from_cli() {
        assert_eq!("Queue".parse::<Permission>().unwrap(), Permission::Queue);
        assert!("admin".parse::<Permission>().is_err());
        assert_eq!("song".parse::<LoopMode>().unwrap(), LoopMode::LoopRecording);
        assert_eq!("off".parse::<LoopMode>().unwrap(), LoopMode::None);
    }
}
