use std::thread;
use std::time::Duration;

use anyhow::Result;

/// Format negotiated with the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames written per call.
    pub period_size: usize,
}

impl SinkParams {
    /// Interleaved samples in one period.
    pub fn period_samples(&self) -> usize {
        self.period_size.max(1) * self.channels as usize
    }

    pub fn duration_of(&self, samples: usize) -> Duration {
        let frames = samples / self.channels.max(1) as usize;
        Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Destination for interleaved i16 PCM.
///
/// `write` blocks until the device accepted the samples, which is what paces
/// the playback thread.
pub trait PcmSink {
    fn params(&self) -> SinkParams;
    fn write(&mut self, samples: &[i16]) -> Result<()>;
}

/// Sink without a device. Consumes samples at the real-time rate so
/// positions and end-of-track behave as with hardware.
pub struct NullSink {
    params: SinkParams,
}

impl NullSink {
    pub fn new(sample_rate: u32, channels: u32, period_size: usize) -> Self {
        let period_size = if period_size == 0 { 1024 } else { period_size };
        Self {
            params: SinkParams {
                sample_rate,
                channels,
                period_size,
            },
        }
    }
}

impl PcmSink for NullSink {
    fn params(&self) -> SinkParams {
        self.params
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        thread::sleep(self.params.duration_of(samples.len()));
        Ok(())
    }
}
