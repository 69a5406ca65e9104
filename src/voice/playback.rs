//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};

use super::devices::find_output_device;
use super::resample::resample;
use super::wav::decode_wav;
use crate::session::StopSignal;
use crate::{Error, Result};

/// Volume change applied by `volume_up` / `volume_down`
const VOLUME_STEP: i64 = 10;

/// Acknowledgment cue pitch
const CUE_FREQUENCY: f32 = 880.0;

/// Acknowledgment cue length
const CUE_DURATION: Duration = Duration::from_millis(100);

/// How often a playing stream is checked for completion or stop
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Grace period for the device to flush its last buffer
const DRAIN_TAIL: Duration = Duration::from_millis(100);

/// How long capture stays muted after a cue starts: the tone plus the
/// device's drain tail
pub const CUE_WINDOW: Duration = CUE_DURATION.saturating_add(DRAIN_TAIL);

/// Mono float audio at a known sample rate
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Sine tone
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn tone(frequency: f32, duration: Duration, sample_rate: u32, amplitude: f32) -> Self {
        let count = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
        let samples = (0..count)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * amplitude
            })
            .collect();
        Self::new(samples, sample_rate)
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = self.samples.len() as f64 / f64::from(self.sample_rate);
        Duration::from_secs_f64(secs)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Output volume, 0 to 100, shared with the audio callback
#[derive(Debug, Clone)]
pub struct Volume(Arc<AtomicU8>);

impl Volume {
    #[must_use]
    pub fn new(level: i64) -> Self {
        Self(Arc::new(AtomicU8::new(clamp_level(level))))
    }

    #[must_use]
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    /// Set the level, clamped to 0..=100; returns the stored level
    pub fn set(&self, level: i64) -> u8 {
        let level = clamp_level(level);
        self.0.store(level, Ordering::Relaxed);
        level
    }

    pub fn volume_up(&self) -> u8 {
        self.set(i64::from(self.get()) + VOLUME_STEP)
    }

    pub fn volume_down(&self) -> u8 {
        self.set(i64::from(self.get()) - VOLUME_STEP)
    }

    /// Linear gain for the current level
    #[must_use]
    pub fn gain(&self) -> f32 {
        f32::from(self.get()) / 100.0
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_level(level: i64) -> u8 {
    level.clamp(0, 100) as u8
}

/// How a `play` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// All audio was rendered
    Drained,
    /// The stop signal cut playback short
    Interrupted,
}

/// Renders response audio
///
/// Audio device streams are tied to the thread that opened them, so sinks
/// are driven from the pipeline task and need not be `Send`.
#[async_trait(?Send)]
pub trait PlaybackSink {
    /// Play a clip until drained or until `stop` fires
    async fn play(&mut self, clip: &AudioClip, stop: &StopSignal) -> Result<PlaybackOutcome>;

    fn volume(&self) -> &Volume;

    /// Takes effect on the next rendered buffer
    fn set_volume(&self, level: i64) -> u8 {
        self.volume().set(level)
    }

    /// Start the short acknowledgment tone without waiting for it
    fn cue(&mut self) -> Result<()>;

    /// Release output resources held by a cue that has finished playing
    fn release_cue(&mut self) {}
}

/// Plays audio through a cpal output device
pub struct CpalPlayback {
    device: Device,
    config: StreamConfig,
    volume: Volume,
    cue: Option<CueHandle<Stream>>,
}

/// An output stream rendering a cue, and whether it has drained
struct CueHandle<S> {
    _stream: S,
    finished: Arc<AtomicBool>,
}

impl<S> CueHandle<S> {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Drop the cue in `slot` once it has drained; returns whether one was dropped
fn release_drained<S>(slot: &mut Option<CueHandle<S>>) -> bool {
    if slot.as_ref().is_some_and(CueHandle::is_finished) {
        *slot = None;
        return true;
    }
    false
}

impl CpalPlayback {
    /// Open the named output device, or the default one
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    pub fn new(device_name: Option<&str>, volume: Volume) -> Result<Self> {
        let host = cpal::default_host();
        let device = find_output_device(&host, device_name)?;

        let config = device
            .default_output_config()
            .map_err(|e| Error::Playback(format!("no default output config: {e}")))?
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            device,
            config,
            volume,
            cue: None,
        })
    }

    /// Bring a clip to the device rate
    fn prepare(&self, clip: &AudioClip) -> Result<Arc<[f32]>> {
        let rate = self.config.sample_rate.0;
        let samples = if clip.sample_rate == rate {
            clip.samples.clone()
        } else {
            resample(&clip.samples, clip.sample_rate, rate)?
        };
        Ok(samples.into())
    }

    /// Start a stream that renders `samples` once, then outputs silence
    fn start_stream(&self, samples: Arc<[f32]>) -> Result<(Stream, Arc<AtomicBool>)> {
        let channels = usize::from(self.config.channels.max(1));
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let volume = self.volume.clone();

        let stream = {
            let finished = Arc::clone(&finished);
            self.device
                .build_output_stream(
                    &self.config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let gain = volume.gain();
                        let mut pos = position.load(Ordering::Relaxed);

                        for frame in data.chunks_mut(channels) {
                            let sample = match samples.get(pos) {
                                Some(&s) => {
                                    pos += 1;
                                    s * gain
                                }
                                None => 0.0,
                            };
                            frame.fill(sample);
                        }

                        position.store(pos, Ordering::Relaxed);
                        if pos >= samples.len() {
                            finished.store(true, Ordering::Release);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Playback(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Playback(e.to_string()))?;
        Ok((stream, finished))
    }
}

#[async_trait(?Send)]
impl PlaybackSink for CpalPlayback {
    async fn play(&mut self, clip: &AudioClip, stop: &StopSignal) -> Result<PlaybackOutcome> {
        if clip.is_empty() {
            return Ok(PlaybackOutcome::Drained);
        }
        self.cue = None;

        let samples = self.prepare(clip)?;
        let sample_count = samples.len();
        let (stream, finished) = self.start_stream(samples)?;

        let timeout = clip.duration() + Duration::from_millis(500);
        let start = Instant::now();

        while !finished.load(Ordering::Acquire) {
            if start.elapsed() > timeout {
                tracing::warn!(
                    expected_ms = clip.duration().as_millis(),
                    "playback did not drain in time"
                );
                break;
            }
            tokio::select! {
                () = stop.requested() => {
                    drop(stream);
                    tracing::info!("playback interrupted");
                    return Ok(PlaybackOutcome::Interrupted);
                }
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        tokio::time::sleep(DRAIN_TAIL).await;
        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");

        Ok(PlaybackOutcome::Drained)
    }

    fn volume(&self) -> &Volume {
        &self.volume
    }

    fn cue(&mut self) -> Result<()> {
        let clip = AudioClip::tone(CUE_FREQUENCY, CUE_DURATION, self.config.sample_rate.0, 0.3);
        let (stream, finished) = self.start_stream(clip.samples.into())?;
        // Dropping the previous cue stream silences it
        self.cue = Some(CueHandle {
            _stream: stream,
            finished,
        });
        Ok(())
    }

    fn release_cue(&mut self) {
        if release_drained(&mut self.cue) {
            tracing::trace!("cue stream released");
        }
    }
}

/// Decode MP3 bytes to a mono clip at the stream's sample rate
///
/// # Errors
///
/// Returns error if the bytes are not decodable MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<AudioClip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("no MP3 frames decoded".to_string()));
    }

    Ok(AudioClip::new(samples, sample_rate))
}

/// Decode synthesized audio, WAV or MP3 by content
///
/// # Errors
///
/// Returns error if the bytes are neither readable WAV nor MP3
pub fn decode_audio(bytes: &[u8]) -> Result<AudioClip> {
    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::wav::samples_to_wav;

    #[test]
    fn volume_clamps_and_steps() {
        let volume = Volume::new(150);
        assert_eq!(volume.get(), 100);
        assert_eq!(volume.volume_up(), 100);
        assert_eq!(volume.volume_down(), 90);
        assert_eq!(volume.set(-5), 0);
        assert_eq!(volume.volume_down(), 0);
        assert_eq!(volume.volume_up(), 10);
    }

    #[test]
    fn volume_is_shared_between_clones() {
        let volume = Volume::new(70);
        let callback_side = volume.clone();
        volume.set(40);
        assert!((callback_side.gain() - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn cue_tone_geometry() {
        let clip = AudioClip::tone(CUE_FREQUENCY, CUE_DURATION, 48_000, 0.3);
        assert_eq!(clip.samples.len(), 4_800);
        assert_eq!(clip.duration(), CUE_DURATION);
        assert!(clip.samples.iter().all(|s| s.abs() <= 0.3));
    }

    #[test]
    fn cue_window_covers_tone_and_drain() {
        assert_eq!(CUE_WINDOW, Duration::from_millis(200));
    }

    struct CountDrops(Arc<AtomicUsize>);

    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn drained_cue_is_released() {
        let drops = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let mut slot = Some(CueHandle {
            _stream: CountDrops(Arc::clone(&drops)),
            finished: Arc::clone(&finished),
        });

        // Still playing
        assert!(!release_drained(&mut slot));
        assert!(slot.is_some());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        finished.store(true, Ordering::Release);
        assert!(release_drained(&mut slot));
        assert!(slot.is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // Nothing left to release
        assert!(!release_drained(&mut slot));
    }

    #[test]
    fn wav_responses_are_sniffed() {
        let wav = samples_to_wav(&[0, 8_192, -8_192], 22_050).unwrap();
        let clip = decode_audio(&wav).unwrap();
        assert_eq!(clip.sample_rate, 22_050);
        assert_eq!(clip.samples.len(), 3);
    }

    #[test]
    fn undecodable_audio_is_an_error() {
        assert!(decode_audio(b"definitely not audio").is_err());
        assert!(decode_audio(b"RIFF but truncated").is_err());
    }

    #[test]
    fn empty_clip_has_zero_duration() {
        assert_eq!(AudioClip::new(Vec::new(), 0).duration(), Duration::ZERO);
    }
}
