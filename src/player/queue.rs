use std::collections::VecDeque;

use rand::seq::SliceRandom;

use super::SequencerError;
use crate::protocol::LoopMode;

/// Queue state without any audio attached.
///
/// `queue` is the order recordings were added in. While shuffle is on,
/// `shuffled` holds the order they are actually played in; it only ever
/// contains ids that are also in `queue`.
#[derive(Debug, Clone)]
pub struct PlayQueue {
    queue: Vec<String>,
    shuffled: Vec<String>,
    shuffle: bool,
    loop_mode: LoopMode,
    now_playing: Option<String>,
    /// Most recent first.
    backlog: VecDeque<String>,
    history_limit: usize,
}

impl PlayQueue {
    pub fn new(history_limit: usize) -> Self {
        Self {
            queue: Vec::new(),
            shuffled: Vec::new(),
            shuffle: false,
            loop_mode: LoopMode::None,
            now_playing: None,
            backlog: VecDeque::new(),
            history_limit,
        }
    }

    pub fn now_playing(&self) -> Option<&str> {
        self.now_playing.as_deref()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn backlog(&self) -> impl Iterator<Item = &str> {
        self.backlog.iter().map(String::as_str)
    }

    /// The upcoming recordings in play order.
    pub fn visible_queue(&self) -> Vec<String> {
        if self.shuffle {
            self.shuffled.clone()
        } else {
            self.queue.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.visible_queue_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn visible_queue_ref(&self) -> &[String] {
        if self.shuffle {
            &self.shuffled
        } else {
            &self.queue
        }
    }

    /// Pick the recording that should play next, according to the loop mode.
    pub fn advance(&mut self) -> Result<String, SequencerError> {
        match self.loop_mode {
            LoopMode::None => {
                if self.shuffle {
                    if self.shuffled.is_empty() {
                        return Err(SequencerError::NoRecordingsQueued);
                    }
                    let id = self.shuffled.remove(0);
                    if let Some(index) = self.queue.iter().position(|queued| *queued == id) {
                        self.queue.remove(index);
                    }
                    Ok(id)
                } else {
                    if self.queue.is_empty() {
                        return Err(SequencerError::NoRecordingsQueued);
                    }
                    Ok(self.queue.remove(0))
                }
            }
            LoopMode::LoopQueue => {
                if self.queue.is_empty() {
                    return Err(SequencerError::NoRecordingsQueued);
                }
                if self.shuffle {
                    if self.shuffled.is_empty() {
                        self.reshuffle();
                    }
                    Ok(self.shuffled.remove(0))
                } else {
                    let id = self.queue.remove(0);
                    self.queue.push(id.clone());
                    Ok(id)
                }
            }
            LoopMode::LoopRecording => self
                .now_playing
                .clone()
                .ok_or(SequencerError::NothingPlaying),
        }
    }

    /// Record that `id` started playing. The recording it replaces moves to
    /// the backlog.
    pub fn start(&mut self, id: String) {
        if self.now_playing.as_deref() == Some(id.as_str()) {
            return;
        }
        if let Some(previous) = self.now_playing.replace(id) {
            self.push_backlog(previous);
        }
    }

    /// Nothing is playing any more.
    pub fn stop(&mut self) {
        if let Some(previous) = self.now_playing.take() {
            self.push_backlog(previous);
        }
    }

    /// The recording [`retreat`](Self::retreat) would step back to.
    pub fn previous(&self) -> Option<&str> {
        self.backlog.front().map(String::as_str)
    }

    /// Step back to the most recently played recording. The current one is
    /// put back at the front of the queue so it plays again next.
    pub fn retreat(&mut self) -> Result<String, SequencerError> {
        let previous = self
            .backlog
            .pop_front()
            .ok_or(SequencerError::NoRecordingsPlayed)?;

        if let Some(current) = self.now_playing.replace(previous.clone()) {
            self.requeue_front(current);
        }

        Ok(previous)
    }

    fn requeue_front(&mut self, id: String) {
        // A looping queue still holds the recording, rotated to the back.
        let looped = match self.loop_mode {
            LoopMode::LoopQueue => self.queue.iter().rposition(|queued| *queued == id),
            _ => None,
        };
        match looped {
            Some(index) if !self.shuffle => {
                let id = self.queue.remove(index);
                self.queue.insert(0, id);
            }
            Some(_) => {}
            None => self.queue.insert(0, id.clone()),
        }

        if self.shuffle {
            self.shuffled.insert(0, id);
        }
    }

    pub fn enqueue(&mut self, ids: impl IntoIterator<Item = String>) {
        self.queue.extend(ids);
        if self.shuffle {
            self.reshuffle();
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.shuffled.clear();
    }

    pub fn set_shuffle(&mut self, enable: bool) {
        self.shuffle = enable;
        if enable {
            self.reshuffle();
        } else {
            self.shuffled.clear();
        }
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    fn reshuffle(&mut self) {
        self.shuffled = self.queue.clone();
        self.shuffled.shuffle(&mut rand::rng());
    }

    fn push_backlog(&mut self, id: String) {
        self.backlog.push_front(id);
        self.backlog.truncate(self.history_limit);
    }
}
