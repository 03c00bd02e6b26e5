//! audio - File decoding, format conversion and device playback.
//!
//! Recordings are decoded with symphonia into interleaved i16 PCM, converted
//! to the output device's rate and channel count, then fed period by period
//! to a [`PcmSink`] from a dedicated playback thread.

#[cfg(feature = "alsa")]
mod alsa_device;
pub mod convert;
pub mod decoder;
mod player;
mod sink;

pub use decoder::{DecodedAudio, decode_file};
pub use player::{PlaybackError, Player, PlayerEvent};
pub use sink::{NullSink, PcmSink, SinkParams};

#[cfg(feature = "alsa")]
pub use alsa_device::AlsaSink;
