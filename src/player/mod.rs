//! What plays next: the queue model and the sequencer driving the output.

mod queue;
mod sequencer;

use std::time::Duration;

use thiserror::Error;

pub use queue::PlayQueue;
pub use sequencer::Sequencer;

/// What the sequencer did after the player reported the end of a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Something else was loaded before the report was handled.
    Ignored,
    Playing(String),
    Stopped,
}

#[derive(Debug, Error, PartialEq)]
pub enum SequencerError {
    #[error("no audio file stored for recording {0}")]
    MissingAudioFile(String),

    #[error("could not decode recording {0}: {1}")]
    Decoding(String, String),

    #[error("cannot seek to {0:?}")]
    SeekFailed(Duration),

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("no recordings have been played")]
    NoRecordingsPlayed,

    #[error("no recordings are queued")]
    NoRecordingsQueued,

    #[error("invalid volume {0}")]
    InvalidVolume(f32),

    #[error("audio output error: {0}")]
    Audio(String),
}
