//! Sample rate conversion for device audio and reference recordings

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input chunk size for the FFT resampler
const CHUNK_SIZE: usize = 1024;

/// Streaming mono resampler
///
/// Buffers are allocated up front; `push` only moves samples around, so it is
/// safe to call from the capture callback.
pub struct StreamResampler {
    inner: FftFixedIn<f32>,
    pending: Vec<f32>,
    output: Vec<Vec<f32>>,
    from: u32,
    to: u32,
}

impl StreamResampler {
    /// Create a resampler converting `from` Hz to `to` Hz
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be constructed for these rates
    pub fn new(from: u32, to: u32) -> Result<Self> {
        let inner = FftFixedIn::<f32>::new(from as usize, to as usize, CHUNK_SIZE, 2, 1)
            .map_err(|e| Error::Audio(format!("cannot resample {from} Hz -> {to} Hz: {e}")))?;
        let output = vec![vec![0.0; inner.output_frames_max()]];

        Ok(Self {
            pending: Vec::with_capacity(CHUNK_SIZE * 4),
            output,
            inner,
            from,
            to,
        })
    }

    #[must_use]
    pub const fn rates(&self) -> (u32, u32) {
        (self.from, self.to)
    }

    /// Output samples of latency the resampler adds
    #[must_use]
    pub fn output_delay(&self) -> usize {
        self.inner.output_delay()
    }

    /// Feed input samples; `emit` receives every completed output chunk
    ///
    /// # Errors
    ///
    /// Returns error if the resampler rejects a chunk
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(&[f32])) -> Result<()> {
        self.pending.extend_from_slice(samples);

        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                return Ok(());
            }

            let (consumed, produced) = self
                .inner
                .process_into_buffer(&[&self.pending[..needed]], &mut self.output, None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;

            emit(&self.output[0][..produced]);
            self.pending.drain(..consumed);
        }
    }

    /// Drop buffered input (after a device glitch)
    pub fn reset(&mut self) {
        self.pending.clear();
        self.inner.reset();
    }
}

/// Resample a whole mono buffer
///
/// The output length is `samples.len() * to / from`, with the resampler's
/// delay removed.
///
/// # Errors
///
/// Returns error if the resampler cannot be constructed or fails
#[allow(clippy::cast_possible_truncation)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected = (samples.len() as u64 * u64::from(to) / u64::from(from)) as usize;
    let mut stream = StreamResampler::new(from, to)?;
    let delay = stream.output_delay();

    let mut out = Vec::with_capacity(expected + delay + CHUNK_SIZE);
    stream.push(samples, |chunk| out.extend_from_slice(chunk))?;

    // Flush the tail and the resampler delay with silence
    let padding = vec![0.0; CHUNK_SIZE * 2 + delay * from as usize / to as usize];
    while out.len() < expected + delay {
        stream.push(&padding, |chunk| out.extend_from_slice(chunk))?;
    }

    Ok(out[delay..delay + expected].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, seconds: f32) -> Vec<f32> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let n = (rate as f32 * seconds) as usize;
        #[allow(clippy::cast_precision_loss)]
        let samples = (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect();
        samples
    }

    #[test]
    fn same_rate_is_identity() {
        let input = sine(440.0, 16_000, 0.1);
        assert_eq!(resample(&input, 16_000, 16_000).unwrap(), input);
    }

    #[test]
    fn downsample_length_matches_ratio() {
        let input = sine(440.0, 48_000, 1.0);
        let output = resample(&input, 48_000, 16_000).unwrap();
        assert_eq!(output.len(), 16_000);
    }

    #[test]
    fn downsample_preserves_level() {
        let input = sine(300.0, 44_100, 0.5);
        let output = resample(&input, 44_100, 16_000).unwrap();
        #[allow(clippy::cast_precision_loss)]
        let rms =
            (output.iter().map(|s| s * s).sum::<f32>() / output.len() as f32).sqrt();
        // 0.5 amplitude sine has RMS ~0.354
        assert!((rms - 0.354).abs() < 0.05, "rms {rms}");
    }

    #[test]
    fn streaming_emits_chunks() {
        let mut stream = StreamResampler::new(48_000, 16_000).unwrap();
        let mut produced = 0;
        for chunk in sine(440.0, 48_000, 0.5).chunks(480) {
            stream.push(chunk, |out| produced += out.len()).unwrap();
        }
        // Everything but the last partial chunk comes out at a third the rate
        assert!(produced > 7_000 && produced <= 8_000, "produced {produced}");
    }
}
