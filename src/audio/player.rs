//! The playback thread and its control handle.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with the async IPC tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tokio::sync::mpsc;

use super::convert::apply_volume;
use super::sink::{NullSink, PcmSink, SinkParams};
use crate::config::AudioSettings;

/// How long the thread naps when there is nothing to play.
const IDLE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The loaded track played to its end and was unloaded.
    Finished,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("no track loaded")]
    NoTrack,
    #[error("position {0:?} is past the end of the track")]
    OutOfRange(Duration),
}

#[derive(Debug)]
struct PlaybackState {
    track: Option<Vec<i16>>,
    cursor: usize,
    paused: bool,
    volume: f32,
}

impl PlaybackState {
    fn new() -> Self {
        Self {
            track: None,
            cursor: 0,
            paused: true,
            volume: 1.0,
        }
    }

    /// Copy the next `max_samples` of the track into `out` with volume
    /// applied. Returns true when this chunk ends the track.
    fn next_chunk(&mut self, max_samples: usize, out: &mut Vec<i16>) -> bool {
        if self.paused {
            return false;
        }
        let Some(track) = &self.track else {
            return false;
        };

        let end = (self.cursor + max_samples).min(track.len());
        out.extend_from_slice(&track[self.cursor..end]);
        apply_volume(out, self.volume);
        self.cursor = end;

        if self.cursor >= track.len() {
            self.track = None;
            self.cursor = 0;
            self.paused = true;
            return true;
        }
        false
    }
}

/// Handle to the playback thread. Tracks are loaded already converted to
/// the sink's format (see [`Player::params`]).
pub struct Player {
    state: Arc<Mutex<PlaybackState>>,
    params: SinkParams,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Player {
    /// Open the output selected by `settings` and start the thread.
    pub fn from_settings(
        settings: &AudioSettings,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Result<Self> {
        let settings = settings.clone();
        match settings.backend.as_str() {
            "null" => Self::start(
                move || {
                    Ok(Box::new(NullSink::new(
                        settings.sample_rate,
                        settings.channels,
                        settings.period_size,
                    )) as Box<dyn PcmSink>)
                },
                events,
            ),
            #[cfg(feature = "alsa")]
            "alsa" => Self::start(
                move || {
                    let sink = super::AlsaSink::open(
                        &settings.playback_device,
                        settings.sample_rate,
                        settings.channels,
                        Some(settings.period_size),
                    )?;
                    Ok(Box::new(sink) as Box<dyn PcmSink>)
                },
                events,
            ),
            other => Err(anyhow!("Unsupported audio backend: {}", other)),
        }
    }

    /// Start the playback thread. The sink is opened on that thread; this
    /// returns once it is open (or failed to open).
    pub fn start<F>(open_sink: F, events: mpsc::UnboundedSender<PlayerEvent>) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn PcmSink>> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(PlaybackState::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<SinkParams>>();

        let handle = {
            let state = state.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    let mut sink = match open_sink() {
                        Ok(sink) => {
                            let _ = ready_tx.send(Ok(sink.params()));
                            sink
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    play_thread(sink.as_mut(), &state, &running, &events);
                })?
        };

        let params = ready_rx
            .recv()
            .map_err(|_| anyhow!("Playback thread exited before opening the output"))??;

        log::info!(
            "Player started: rate={}, ch={}, period={}",
            params.sample_rate,
            params.channels,
            params.period_size
        );

        Ok(Self {
            state,
            params,
            running,
            handle: Some(handle),
        })
    }

    pub fn params(&self) -> SinkParams {
        self.params
    }

    fn state(&self) -> MutexGuard<'_, PlaybackState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the current track. The new track starts paused.
    pub fn load(&self, samples: Vec<i16>) {
        let mut state = self.state();
        state.track = Some(samples);
        state.cursor = 0;
        state.paused = true;
    }

    /// Resume playback. Returns false when no track is loaded.
    pub fn play(&self) -> bool {
        let mut state = self.state();
        if state.track.is_none() {
            return false;
        }
        state.paused = false;
        true
    }

    pub fn pause(&self) {
        self.state().paused = true;
    }

    /// Unload the current track.
    pub fn stop(&self) {
        let mut state = self.state();
        state.track = None;
        state.cursor = 0;
        state.paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn has_track(&self) -> bool {
        self.state().track.is_some()
    }

    pub fn seek(&self, position: Duration) -> Result<(), PlaybackError> {
        let channels = self.params.channels.max(1) as usize;
        let frame = (position.as_secs_f64() * self.params.sample_rate as f64) as usize;

        let mut state = self.state();
        let Some(track) = &state.track else {
            return Err(PlaybackError::NoTrack);
        };
        let cursor = frame * channels;
        if cursor > track.len() {
            return Err(PlaybackError::OutOfRange(position));
        }
        state.cursor = cursor;
        Ok(())
    }

    pub fn position(&self) -> Duration {
        self.params.duration_of(self.state().cursor)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.state()
            .track
            .as_ref()
            .map(|track| self.params.duration_of(track.len()))
    }

    pub fn set_volume(&self, volume: f32) {
        self.state().volume = volume;
    }

    pub fn volume(&self) -> f32 {
        self.state().volume
    }

    /// Signal the thread to stop and wait for it.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn play_thread(
    sink: &mut dyn PcmSink,
    state: &Mutex<PlaybackState>,
    running: &AtomicBool,
    events: &mpsc::UnboundedSender<PlayerEvent>,
) {
    let period_samples = sink.params().period_samples();
    let mut chunk: Vec<i16> = Vec::with_capacity(period_samples);

    while running.load(Ordering::Relaxed) {
        chunk.clear();
        let finished = {
            let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.next_chunk(period_samples, &mut chunk)
        };

        if chunk.is_empty() {
            if !finished {
                thread::sleep(IDLE_INTERVAL);
                continue;
            }
        } else if let Err(e) = sink.write(&chunk) {
            log::error!("Audio output error: {}", e);
            thread::sleep(IDLE_INTERVAL);
        }

        if finished {
            log::debug!("Track finished");
            if events.send(PlayerEvent::Finished).is_err() {
                log::warn!("Player event receiver dropped");
            }
        }
    }

    log::info!("Playback stopped");
}
