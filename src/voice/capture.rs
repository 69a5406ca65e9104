//! Audio capture from microphone into the ring buffer

use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, Stream, StreamConfig};

use super::devices::find_input_device;
use super::frame::{f32_to_i16, i16_to_f32};
use super::resample::StreamResampler;
use super::ring_buffer::RingBuffer;
use crate::session::SharedSession;
use crate::{Error, Result};

/// Producer side of the pipeline: pushes frames into a ring buffer
pub trait FrameSource {
    /// Begin delivering frames
    ///
    /// # Errors
    ///
    /// Returns error if the underlying device cannot be started
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Turns device callback buffers into pipeline frames
///
/// Downmixes to mono, resamples to the pipeline rate, converts to 16-bit and
/// writes whole frames to the ring buffer. Scratch buffers are reused, so
/// after the first callbacks nothing is allocated.
pub struct FrameAssembler {
    buffer: Arc<RingBuffer>,
    session: SharedSession,
    channels: usize,
    resampler: Option<StreamResampler>,
    mono: Vec<f32>,
    pending: Vec<i16>,
    suppressed: bool,
    frames_suppressed: u64,
}

impl FrameAssembler {
    /// Assembler for a device delivering `channels` interleaved channels at
    /// `device_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no resampler exists for the rate pair
    pub fn new(
        buffer: Arc<RingBuffer>,
        session: SharedSession,
        device_rate: u32,
        channels: u16,
    ) -> Result<Self> {
        let spec = buffer.spec();
        let resampler = if device_rate == spec.sample_rate() {
            None
        } else {
            tracing::info!(
                from = device_rate,
                to = spec.sample_rate(),
                "resampling capture audio"
            );
            Some(StreamResampler::new(device_rate, spec.sample_rate())?)
        };

        Ok(Self {
            buffer,
            session,
            channels: usize::from(channels.max(1)),
            resampler,
            mono: Vec::with_capacity(4096),
            pending: Vec::with_capacity(spec.frame_len()),
            suppressed: false,
            frames_suppressed: 0,
        })
    }

    /// Handle one device buffer of interleaved float samples
    pub fn push(&mut self, data: &[f32]) {
        self.push_with(data, |sample| sample);
    }

    /// Handle one device buffer of interleaved samples in another format
    pub fn push_with<T: Copy>(&mut self, data: &[T], to_f32: impl Fn(T) -> f32) {
        if self.session.state().suppresses_capture() {
            if !self.suppressed {
                tracing::debug!("capture suppressed during playback");
                self.suppressed = true;
                self.pending.clear();
                if let Some(resampler) = self.resampler.as_mut() {
                    resampler.reset();
                }
            }
            self.frames_suppressed += (data.len() / self.channels) as u64;
            return;
        }
        if self.suppressed {
            tracing::debug!(device_frames = self.frames_suppressed, "capture resumed");
            self.suppressed = false;
            self.frames_suppressed = 0;
        }

        self.mono.clear();
        if self.channels == 1 {
            self.mono.extend(data.iter().map(|&s| to_f32(s)));
        } else {
            #[allow(clippy::cast_precision_loss)]
            let scale = 1.0 / self.channels as f32;
            self.mono.extend(
                data.chunks(self.channels)
                    .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() * scale),
            );
        }

        let Self {
            buffer,
            resampler,
            mono,
            pending,
            ..
        } = self;

        match resampler {
            Some(resampler) => {
                if let Err(e) = resampler.push(mono, |out| write_frames(buffer, pending, out)) {
                    tracing::warn!(error = %e, "dropping capture audio after resampler error");
                    resampler.reset();
                    pending.clear();
                }
            }
            None => write_frames(buffer, pending, mono),
        }
    }
}

fn write_frames(buffer: &RingBuffer, pending: &mut Vec<i16>, samples: &[f32]) {
    let frame_len = buffer.spec().frame_len();
    for &sample in samples {
        pending.push(f32_to_i16(sample));
        if pending.len() == frame_len {
            if let Err(e) = buffer.write(pending) {
                tracing::warn!(error = %e, "dropping malformed frame");
            }
            pending.clear();
        }
    }
}

/// Microphone capture through cpal
pub struct CpalFrameSource {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    buffer: Arc<RingBuffer>,
    session: SharedSession,
    stream: Option<Stream>,
}

impl CpalFrameSource {
    /// Open the named input device, or the default one
    ///
    /// The device runs at its native configuration; conversion to the
    /// pipeline format happens in software.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(
        device_name: Option<&str>,
        buffer: Arc<RingBuffer>,
        session: SharedSession,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = find_input_device(&host, device_name)?;

        let supported = device
            .default_input_config()
            .map_err(|e| Error::Audio(format!("no default input config: {e}")))?;
        let sample_format = supported.sample_format();
        let config = supported.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = %sample_format,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            sample_format,
            buffer,
            session,
            stream: None,
        })
    }
}

impl CpalFrameSource {
    fn build_stream<T>(
        &self,
        mut assembler: FrameAssembler,
        to_f32: fn(T) -> f32,
    ) -> Result<Stream>
    where
        T: SizedSample + Copy + Send + 'static,
    {
        self.device
            .build_input_stream(
                &self.config,
                move |data: &[T], _: &cpal::InputCallbackInfo| assembler.push_with(data, to_f32),
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))
    }
}

fn u16_to_f32(sample: u16) -> f32 {
    (f32::from(sample) - 32_768.0) / 32_768.0
}

#[allow(clippy::cast_precision_loss)]
fn i32_to_f32(sample: i32) -> f32 {
    sample as f32 / 2_147_483_648.0
}

impl FrameSource for CpalFrameSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let assembler = FrameAssembler::new(
            Arc::clone(&self.buffer),
            self.session.clone(),
            self.config.sample_rate.0,
            self.config.channels,
        )?;

        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream(assembler, |s: f32| s)?,
            SampleFormat::I16 => self.build_stream(assembler, i16_to_f32)?,
            SampleFormat::U16 => self.build_stream(assembler, u16_to_f32)?,
            SampleFormat::I32 => self.build_stream(assembler, i32_to_f32)?,
            other => {
                return Err(Error::Audio(format!(
                    "unsupported input sample format {other}"
                )));
            }
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CpalFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::voice::frame::FrameSpec;

    fn assembler(device_rate: u32, channels: u16) -> (FrameAssembler, Arc<RingBuffer>, SharedSession) {
        let buffer = Arc::new(RingBuffer::with_frames(FrameSpec::default(), 64));
        let session = SharedSession::new();
        let assembler =
            FrameAssembler::new(Arc::clone(&buffer), session.clone(), device_rate, channels)
                .unwrap();
        (assembler, buffer, session)
    }

    #[test]
    fn partial_callbacks_join_into_frames() {
        let (mut assembler, buffer, _) = assembler(16_000, 1);
        assembler.push(&[0.1; 300]);
        assert_eq!(buffer.frames_written(), 0);
        assembler.push(&[0.1; 300]);
        assert_eq!(buffer.frames_written(), 1);
        assembler.push(&[0.1; 360]);
        assert_eq!(buffer.frames_written(), 2);
    }

    #[test]
    fn stereo_is_mixed_down() {
        let (mut assembler, buffer, _) = assembler(16_000, 2);
        let interleaved: Vec<f32> = (0..960).map(|i| if i % 2 == 0 { 0.5 } else { 0.0 }).collect();
        assembler.push(&interleaved);

        let samples = buffer.read_last(std::time::Duration::from_millis(30));
        assert_eq!(samples.len(), 480);
        assert!(samples.iter().all(|&s| (s - f32_to_i16(0.25)).abs() <= 1));
    }

    #[test]
    fn device_rate_is_converted() {
        let (mut assembler, buffer, _) = assembler(48_000, 1);
        // One second at 48 kHz is about 33 frames at 16 kHz once the
        // resampler has filled
        for _ in 0..48 {
            assembler.push(&[0.0; 1_000]);
        }
        let written = buffer.frames_written();
        assert!((28..=34).contains(&written), "wrote {written} frames");
    }

    #[test]
    fn integer_formats_match_float_input() {
        let (mut from_f32, f32_buffer, _) = assembler(16_000, 1);
        let (mut from_i16, i16_buffer, _) = assembler(16_000, 1);
        let (mut from_u16, u16_buffer, _) = assembler(16_000, 1);

        from_f32.push(&[0.5; 480]);
        from_i16.push_with(&[16_384i16; 480], i16_to_f32);
        from_u16.push_with(&[49_152u16; 480], u16_to_f32);

        let expected = f32_buffer.read_last(std::time::Duration::from_millis(30));
        assert_eq!(expected.len(), 480);
        for samples in [
            i16_buffer.read_last(std::time::Duration::from_millis(30)),
            u16_buffer.read_last(std::time::Duration::from_millis(30)),
        ] {
            assert_eq!(samples.len(), 480);
            assert!(
                samples
                    .iter()
                    .zip(&expected)
                    .all(|(a, b)| (a - b).abs() <= 1)
            );
        }
    }

    #[test]
    fn unsigned_and_wide_samples_are_centered() {
        assert!(u16_to_f32(32_768).abs() < f32::EPSILON);
        assert!((u16_to_f32(0) + 1.0).abs() < f32::EPSILON);
        assert!(i32_to_f32(0).abs() < f32::EPSILON);
        assert!((i32_to_f32(i32::MIN) + 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn speaking_suppresses_capture() {
        let (mut assembler, buffer, session) = assembler(16_000, 1);
        assembler.push(&[0.1; 240]);

        session.set(SessionState::Speaking);
        assembler.push(&[0.1; 4_800]);
        assert_eq!(buffer.frames_written(), 0);

        // The half frame from before playback was dropped
        session.set(SessionState::Idle);
        assembler.push(&[0.1; 240]);
        assert_eq!(buffer.frames_written(), 0);
        assembler.push(&[0.1; 240]);
        assert_eq!(buffer.frames_written(), 1);
    }
}
