//! Recording library: metadata rows in SQLite, audio files stored under the
//! SHA-256 of their contents, and a metadata provider for recordings the
//! library has not seen yet.

pub(crate) mod database;
pub mod musicbrainz;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use database::Library;
pub use musicbrainz::{MetadataProvider, MusicBrainzClient, OfflineProvider};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("invalid recording id '{0}'")]
    InvalidRecordingId(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("background task failed: {0}")]
    Background(String),

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("no metadata for recording {0}")]
    RecordingMetadataNotFound(String),

    #[error("no audio file for recording {0}")]
    RecordingFileNotFound(String),

    #[error("playlist {0} not found")]
    PlaylistNotFound(Uuid),
}

impl LibraryError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LibraryError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArtistCredit {
    pub name: String,
    #[serde(default)]
    pub joinphrase: String,
}

/// The part of a MusicBrainz recording the player cares about.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub id: String,
    pub title: String,
    /// Length in milliseconds.
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default, rename = "artist-credit")]
    pub artist_credit: Vec<ArtistCredit>,
    #[serde(default, rename = "first-release-date")]
    pub first_release_date: Option<String>,
    #[serde(default)]
    pub disambiguation: Option<String>,
}

impl Recording {
    /// Render the artist credit the way MusicBrainz displays it,
    /// e.g. `"A feat. B"`.
    pub fn artist_line(&self) -> String {
        self.artist_credit
            .iter()
            .map(|credit| format!("{}{}", credit.name, credit.joinphrase))
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordingMetadata {
    pub audio_file_hash: Option<String>,

    pub recording: Recording,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlaylistMetadata {
    pub id: Uuid,

    pub name: String,

    pub recordings: Vec<String>,
}

/// Recording ids are MusicBrainz ids; store them in canonical hyphenated form.
pub fn normalize_recording_id(id: &str) -> Result<String, LibraryError> {
    Uuid::parse_str(id.trim())
        .map(|uuid| uuid.hyphenated().to_string())
        .map_err(|_| LibraryError::InvalidRecordingId(id.to_string()))
}
