//! Sample format conversion between decoded files and the output device.

use super::decoder::DecodedAudio;

/// Convert interleaved samples from `from` channels to `to` channels.
///
/// Downmixing to mono averages every channel; any other mapping wraps
/// source channels (mono → stereo duplicates).
pub fn convert_channels(samples: &[i16], from: u32, to: u32) -> Vec<i16> {
    let from = from.max(1) as usize;
    let to = to.max(1) as usize;

    if from == to {
        return samples.to_vec();
    }

    let frames = samples.len() / from;

    if to == 1 {
        return samples
            .chunks_exact(from)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / from as i32) as i16
            })
            .collect();
    }

    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        for c in 0..to {
            out.push(frame[c % from]);
        }
    }
    out
}

/// Linear-interpolation resampler over interleaved samples.
pub fn resample_linear(samples: &[i16], channels: u32, from_rate: u32, to_rate: u32) -> Vec<i16> {
    let channels = channels.max(1) as usize;
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let in_frames = samples.len() / channels;
    if in_frames == 0 {
        return Vec::new();
    }

    let out_frames = (in_frames as u64 * to_rate as u64).div_ceil(from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let position = i as f64 * step;
        let index = (position.floor() as usize).min(in_frames - 1);
        let next = (index + 1).min(in_frames - 1);
        let fraction = position - index as f64;

        for c in 0..channels {
            let a = samples[index * channels + c] as f64;
            let b = samples[next * channels + c] as f64;
            out.push((a + (b - a) * fraction).round() as i16);
        }
    }
    out
}

/// Bring a decoded recording to the device's channel count and rate.
pub fn prepare_for_output(decoded: DecodedAudio, sample_rate: u32, channels: u32) -> Vec<i16> {
    let converted = if decoded.channels == channels {
        decoded.samples
    } else {
        convert_channels(&decoded.samples, decoded.channels, channels)
    };

    if decoded.sample_rate == sample_rate {
        converted
    } else {
        resample_linear(&converted, channels, decoded.sample_rate, sample_rate)
    }
}

/// Scale samples by `volume`, saturating at the i16 range.
pub fn apply_volume(samples: &mut [i16], volume: f32) {
    if volume == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample as f32 * volume)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}
