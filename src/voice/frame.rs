//! PCM frames and the frame geometry shared by every pipeline stage

use std::time::Duration;

use crate::{Error, Result};

/// Sample rates the frame pipeline (and the VAD) accept
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];

/// Frame durations the frame pipeline (and the VAD) accept
pub const SUPPORTED_FRAME_DURATIONS_MS: [u32; 3] = [10, 20, 30];

/// Validated frame geometry: sample rate and frame duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    sample_rate: u32,
    frame_duration_ms: u32,
}

impl FrameSpec {
    /// Create a frame spec
    ///
    /// # Errors
    ///
    /// Returns error if the sample rate or frame duration is unsupported
    pub fn new(sample_rate: u32, frame_duration_ms: u32) -> Result<Self> {
        if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
            return Err(Error::UnsupportedSampleRate(sample_rate));
        }
        if !SUPPORTED_FRAME_DURATIONS_MS.contains(&frame_duration_ms) {
            return Err(Error::UnsupportedFrameDuration(frame_duration_ms));
        }

        Ok(Self {
            sample_rate,
            frame_duration_ms,
        })
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn frame_duration_ms(&self) -> u32 {
        self.frame_duration_ms
    }

    /// Samples per frame (every supported rate is a whole number of kHz)
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        (self.sample_rate / 1000 * self.frame_duration_ms) as usize
    }

    #[must_use]
    pub const fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }

    /// Whole frames that fit in `duration` (rounded down)
    #[must_use]
    pub fn frames_floor(&self, duration: Duration) -> u64 {
        duration_ms(duration) / u64::from(self.frame_duration_ms)
    }

    /// Frames needed to cover `duration` (rounded up)
    #[must_use]
    pub fn frames_ceil(&self, duration: Duration) -> u64 {
        duration_ms(duration).div_ceil(u64::from(self.frame_duration_ms))
    }

    /// Samples in `duration`, rounded down
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn samples_in(&self, duration: Duration) -> usize {
        let micros = duration.as_micros();
        (micros * u128::from(self.sample_rate) / 1_000_000) as usize
    }

    /// Duration covered by `frames` frames
    #[must_use]
    pub fn duration_of(&self, frames: u64) -> Duration {
        Duration::from_millis(frames * u64::from(self.frame_duration_ms))
    }
}

impl Default for FrameSpec {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_duration_ms: 30,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// A fixed-length chunk of mono 16-bit PCM
///
/// Frames are immutable once produced. The index is the frame's position in
/// the capture stream, assigned when it was written to the ring buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    index: u64,
    samples: Box<[i16]>,
}

impl Frame {
    /// Wrap samples as a frame with the given stream index
    #[must_use]
    pub fn new(index: u64, samples: impl Into<Box<[i16]>>) -> Self {
        Self {
            index,
            samples: samples.into(),
        }
    }

    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn into_samples(self) -> Box<[i16]> {
        self.samples
    }

    /// RMS level normalized to [0.0, 1.0]
    #[must_use]
    pub fn rms(&self) -> f32 {
        rms_i16(&self.samples)
    }
}

/// RMS level of 16-bit samples normalized to [0.0, 1.0]
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    rms
}

/// Convert a float sample in [-1.0, 1.0] to 16-bit PCM
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert a 16-bit PCM sample to a float in [-1.0, 1.0)
#[must_use]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}
