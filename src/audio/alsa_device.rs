//! ALSA playback sink.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::sink::{PcmSink, SinkParams};

/// Consecutive failed recoveries before the rest of a chunk is dropped.
const MAX_RECOVERY_RETRIES: u32 = 3;

pub struct AlsaSink {
    pcm: PCM,
    params: SinkParams,
}

impl AlsaSink {
    /// Open `device` for interleaved S16LE playback. Rate, channel count and
    /// period size are requests; the negotiated values are in `params()`.
    pub fn open(
        device: &str,
        sample_rate: u32,
        channels: u32,
        period_size: Option<usize>,
    ) -> Result<Self> {
        let pcm = PCM::new(device, Direction::Playback, false)
            .with_context(|| format!("Failed to open PCM device '{}' for playback", device))?;

        {
            let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_format(Format::S16LE)?;
            hwp.set_channels(channels)?;
            hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
            if let Some(ps) = period_size {
                hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
            }
            pcm.hw_params(&hwp)?;
        }

        let params = {
            let hwp = pcm.hw_params_current()?;
            SinkParams {
                sample_rate: hwp.get_rate()?,
                channels: hwp.get_channels()?,
                period_size: hwp.get_period_size()? as usize,
            }
        };

        log::info!(
            "ALSA playback: device={}, rate={}, channels={}, period_size={}",
            device,
            params.sample_rate,
            params.channels,
            params.period_size,
        );

        Ok(Self { pcm, params })
    }
}

impl PcmSink for AlsaSink {
    fn params(&self) -> SinkParams {
        self.params
    }

    // Short writes and XRUNs are retried until the whole chunk is out, or
    // the device keeps failing and the remainder is dropped.
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let channels = self.params.channels as usize;
        let io = self.pcm.io_i16()?;

        let total_frames = samples.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&samples[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    self.pcm
                        .prepare()
                        .context("Failed to recover PCM playback")?;

                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached, dropping {} unwritten frames",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
