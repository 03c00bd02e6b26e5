use std::time::Duration;

use tokio::sync::Mutex;

use super::{FinishOutcome, PlayQueue, SequencerError};
use crate::audio::{PlaybackError, Player, convert, decode_file};
use crate::library::{Library, normalize_recording_id};
use crate::protocol::{LoopMode, PlayerStatus};

/// Drives the [`Player`] from a [`PlayQueue`], loading audio from the
/// [`Library`].
pub struct Sequencer {
    library: Library,
    player: Player,
    queue: Mutex<PlayQueue>,
}

impl Sequencer {
    pub fn new(library: Library, player: Player, history_limit: usize) -> Self {
        Self {
            library,
            player,
            queue: Mutex::new(PlayQueue::new(history_limit)),
        }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Decode `id` and hand it to the player, paused.
    async fn load(&self, id: &str) -> Result<(), SequencerError> {
        let path = self
            .library
            .recording_file(id)
            .await
            .map_err(|_| SequencerError::MissingAudioFile(id.to_string()))?;

        let params = self.player.params();
        let decoding_id = id.to_string();
        let samples = tokio::task::spawn_blocking(move || {
            decode_file(&path)
                .map(|decoded| {
                    convert::prepare_for_output(decoded, params.sample_rate, params.channels)
                })
                .map_err(|e| SequencerError::Decoding(decoding_id, format!("{:#}", e)))
        })
        .await
        .map_err(|e| SequencerError::Audio(e.to_string()))??;

        self.player.load(samples);
        Ok(())
    }

    async fn start(&self, queue: &mut PlayQueue, id: String) -> Result<String, SequencerError> {
        self.load(&id).await?;
        if !self.player.play() {
            return Err(SequencerError::Audio("track was not loaded".into()));
        }
        log::info!("Now playing {}", id);
        queue.start(id.clone());
        Ok(id)
    }

    /// Play `id`, or resume the paused recording, or start the next one.
    /// Returns the id that is now playing.
    pub async fn play(&self, id: Option<String>) -> Result<String, SequencerError> {
        let mut queue = self.queue.lock().await;

        match id {
            Some(id) => {
                let id = normalize_recording_id(&id)
                    .map_err(|_| SequencerError::MissingAudioFile(id.clone()))?;
                self.start(&mut queue, id).await
            }
            None => {
                if let Some(current) = queue.now_playing().map(str::to_string)
                    && self.player.play()
                {
                    return Ok(current);
                }
                let next = queue.advance()?;
                self.start(&mut queue, next).await
            }
        }
    }

    /// Pause playback. Returns the paused recording.
    pub async fn pause(&self) -> Result<String, SequencerError> {
        let queue = self.queue.lock().await;
        let current = queue
            .now_playing()
            .filter(|_| self.player.has_track())
            .ok_or(SequencerError::NothingPlaying)?;
        self.player.pause();
        Ok(current.to_string())
    }

    pub async fn seek(&self, position: Duration) -> Result<Duration, SequencerError> {
        self.player.seek(position).map_err(|e| match e {
            PlaybackError::NoTrack => SequencerError::NothingPlaying,
            PlaybackError::OutOfRange(position) => SequencerError::SeekFailed(position),
        })?;
        Ok(self.player.position())
    }

    pub async fn next(&self) -> Result<String, SequencerError> {
        let mut queue = self.queue.lock().await;
        let next = queue.advance()?;
        self.start(&mut queue, next).await
    }

    pub async fn previous(&self) -> Result<String, SequencerError> {
        let mut queue = self.queue.lock().await;
        let previous = queue
            .previous()
            .map(str::to_string)
            .ok_or(SequencerError::NoRecordingsPlayed)?;
        // The queue only steps back once the recording is loaded.
        self.load(&previous).await?;
        queue.retreat()?;
        self.player.play();
        log::info!("Back to {}", previous);
        Ok(previous)
    }

    /// Queue every id that has a stored audio file. Returns the ids that
    /// could not be queued.
    pub async fn add_queue(&self, ids: Vec<String>) -> Vec<String> {
        let mut playable = Vec::new();
        let mut unplayable = Vec::new();

        for id in ids {
            match normalize_recording_id(&id) {
                Ok(normalized) if self.library.recording_file(&normalized).await.is_ok() => {
                    playable.push(normalized)
                }
                _ => unplayable.push(id),
            }
        }

        log::debug!(
            "Queued {} recordings, {} unplayable",
            playable.len(),
            unplayable.len()
        );
        self.queue.lock().await.enqueue(playable);
        unplayable
    }

    pub async fn queue(&self) -> Vec<String> {
        self.queue.lock().await.visible_queue()
    }

    pub async fn clear_queue(&self) {
        self.queue.lock().await.clear();
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) {
        self.queue.lock().await.set_loop_mode(mode);
    }

    pub async fn set_shuffle(&self, enable: bool) {
        self.queue.lock().await.set_shuffle(enable);
    }

    /// Set the output volume. Out-of-range values are clamped to `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) -> Result<f32, SequencerError> {
        if !volume.is_finite() {
            return Err(SequencerError::InvalidVolume(volume));
        }
        let volume = volume.clamp(0.0, 1.0);
        self.player.set_volume(volume);
        Ok(volume)
    }

    pub async fn position(&self) -> Result<Duration, SequencerError> {
        if !self.player.has_track() {
            return Err(SequencerError::NothingPlaying);
        }
        Ok(self.player.position())
    }

    pub async fn status(&self) -> PlayerStatus {
        let queue = self.queue.lock().await;
        let has_track = self.player.has_track();
        PlayerStatus {
            now_playing: queue
                .now_playing()
                .filter(|_| has_track)
                .map(str::to_string),
            paused: self.player.is_paused(),
            position: if has_track {
                self.player.position()
            } else {
                Duration::ZERO
            },
            volume: self.player.volume(),
            loop_mode: queue.loop_mode(),
            shuffle: queue.shuffle(),
            queue_length: queue.len(),
        }
    }

    /// The player reported the end of a track. Starts whatever comes next.
    ///
    /// Reports that arrive after another recording was loaded are ignored.
    /// Recordings that fail to load are skipped.
    pub async fn on_finished(&self) -> Result<FinishOutcome, SequencerError> {
        let mut queue = self.queue.lock().await;
        if self.player.has_track() {
            log::debug!("Ignoring end of track, {:?} is loaded", queue.now_playing());
            return Ok(FinishOutcome::Ignored);
        }
        let mut attempts = queue.len() + 1;

        loop {
            let next = match queue.advance() {
                Ok(next) => next,
                Err(SequencerError::NoRecordingsQueued | SequencerError::NothingPlaying) => {
                    log::info!("Queue finished");
                    queue.stop();
                    return Ok(FinishOutcome::Stopped);
                }
                Err(e) => return Err(e),
            };

            match self.start(&mut queue, next.clone()).await {
                Ok(id) => return Ok(FinishOutcome::Playing(id)),
                Err(e) => {
                    log::warn!("Skipping {}: {}", next, e);
                    attempts -= 1;
                    if attempts == 0 || queue.loop_mode() == LoopMode::LoopRecording {
                        queue.stop();
                        return Err(e);
                    }
                }
            }
        }
    }
}
