//! Voice activity detection and utterance-end tracking
//!
//! A [`SpeechClassifier`] labels each frame as speech or not; the
//! [`VoiceActivityDetector`] keeps the consecutive speech/silence run lengths
//! and decides when an utterance has ended.

use webrtc_vad::{SampleRate, Vad, VadMode};

use super::frame::{Frame, FrameSpec};
use crate::{Error, Result};

/// Per-frame speech/non-speech classifier
pub trait SpeechClassifier {
    /// Classify one frame of the configured length
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the frame
    fn is_speech(&mut self, samples: &[i16]) -> Result<bool>;

    /// Clear any internal state
    fn reset(&mut self) {}
}

/// WebRTC VAD backend
pub struct WebRtcClassifier {
    vad: Vad,
    spec: FrameSpec,
    aggressiveness: u8,
}

impl WebRtcClassifier {
    /// Create a classifier for the frame geometry and aggressiveness (0-3)
    ///
    /// # Errors
    ///
    /// Returns error if the aggressiveness is out of range
    pub fn new(spec: FrameSpec, aggressiveness: u8) -> Result<Self> {
        let vad = build_vad(spec, aggressiveness)?;

        tracing::debug!(
            sample_rate = spec.sample_rate(),
            aggressiveness,
            "webrtc vad initialized"
        );

        Ok(Self {
            vad,
            spec,
            aggressiveness,
        })
    }

    #[must_use]
    pub const fn aggressiveness(&self) -> u8 {
        self.aggressiveness
    }
}

impl SpeechClassifier for WebRtcClassifier {
    fn is_speech(&mut self, samples: &[i16]) -> Result<bool> {
        self.vad
            .is_voice_segment(samples)
            .map_err(|_| Error::Vad(format!("webrtc vad rejected {} samples", samples.len())))
    }

    fn reset(&mut self) {
        // Geometry and mode were validated in `new`
        if let Ok(vad) = build_vad(self.spec, self.aggressiveness) {
            self.vad = vad;
        }
    }
}

fn build_vad(spec: FrameSpec, aggressiveness: u8) -> Result<Vad> {
    let mode = vad_mode(aggressiveness)?;
    let rate = match spec.sample_rate() {
        8_000 => SampleRate::Rate8kHz,
        16_000 => SampleRate::Rate16kHz,
        32_000 => SampleRate::Rate32kHz,
        48_000 => SampleRate::Rate48kHz,
        other => return Err(Error::UnsupportedSampleRate(other)),
    };

    let mut vad = Vad::new();
    vad.set_mode(mode);
    vad.set_sample_rate(rate);
    Ok(vad)
}

fn vad_mode(aggressiveness: u8) -> Result<VadMode> {
    match aggressiveness {
        0 => Ok(VadMode::Quality),
        1 => Ok(VadMode::LowBitrate),
        2 => Ok(VadMode::Aggressive),
        3 => Ok(VadMode::VeryAggressive),
        other => Err(Error::Config(format!(
            "vad aggressiveness must be 0-3, got {other}"
        ))),
    }
}

/// RMS energy threshold classifier
///
/// Used by tooling when the WebRTC model is not wanted (replaying
/// synthetic fixtures, hardware checks).
pub struct EnergyClassifier {
    threshold: f32,
}

impl EnergyClassifier {
    /// Thresholds indexed by aggressiveness: stricter levels need louder audio
    const THRESHOLDS: [f32; 4] = [0.005, 0.01, 0.02, 0.04];

    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Classifier whose threshold follows the aggressiveness scale (0-3)
    ///
    /// # Errors
    ///
    /// Returns error if the aggressiveness is out of range
    pub fn with_aggressiveness(aggressiveness: u8) -> Result<Self> {
        Self::THRESHOLDS
            .get(usize::from(aggressiveness))
            .map(|&t| Self::new(t))
            .ok_or_else(|| {
                Error::Config(format!("vad aggressiveness must be 0-3, got {aggressiveness}"))
            })
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn is_speech(&mut self, samples: &[i16]) -> Result<bool> {
        Ok(super::frame::rms_i16(samples) >= self.threshold)
    }
}

/// Consecutive speech/silence run lengths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechState {
    pub consecutive_speech_frames: u32,
    pub consecutive_silence_frames: u32,
}

/// Frame classifier plus utterance-boundary tracking
pub struct VoiceActivityDetector {
    classifier: Box<dyn SpeechClassifier>,
    spec: FrameSpec,
    state: SpeechState,
    /// Speech frames seen since the last reset or detected end
    speech_frames: u32,
}

impl VoiceActivityDetector {
    #[must_use]
    pub fn new(classifier: Box<dyn SpeechClassifier>, spec: FrameSpec) -> Self {
        Self {
            classifier,
            spec,
            state: SpeechState::default(),
            speech_frames: 0,
        }
    }

    /// Detector backed by WebRTC VAD
    ///
    /// # Errors
    ///
    /// Returns error if the geometry or aggressiveness is unsupported
    pub fn webrtc(spec: FrameSpec, aggressiveness: u8) -> Result<Self> {
        Ok(Self::new(
            Box::new(WebRtcClassifier::new(spec, aggressiveness)?),
            spec,
        ))
    }

    /// Classify a frame as speech or non-speech
    ///
    /// Does not touch the run lengths; see [`Self::update_run_lengths`].
    ///
    /// # Errors
    ///
    /// Returns `FrameSizeMismatch` if the frame length does not match the
    /// configured geometry, or the classifier's error
    pub fn classify(&mut self, frame: &Frame) -> Result<bool> {
        let expected = self.spec.frame_len();
        if frame.len() != expected {
            return Err(Error::FrameSizeMismatch {
                expected,
                actual: frame.len(),
            });
        }
        self.classifier.is_speech(frame.samples())
    }

    /// Fold one classification into the run lengths
    pub const fn update_run_lengths(&mut self, is_speech: bool) {
        if is_speech {
            self.state.consecutive_speech_frames += 1;
            self.state.consecutive_silence_frames = 0;
            self.speech_frames += 1;
        } else {
            self.state.consecutive_silence_frames += 1;
            self.state.consecutive_speech_frames = 0;
        }
    }

    /// Whether the current utterance has ended
    ///
    /// True once at least one speech frame was seen and the silence run has
    /// reached `silence_threshold_frames`. Detection resets all counters, so
    /// each utterance reports its end exactly once.
    pub fn is_utterance_end(&mut self, silence_threshold_frames: u32) -> bool {
        let ended = self.speech_frames > 0
            && self.state.consecutive_silence_frames >= silence_threshold_frames.max(1);
        if ended {
            self.reset_counters();
        }
        ended
    }

    /// Whether any speech was seen since the last reset
    #[must_use]
    pub const fn has_speech(&self) -> bool {
        self.speech_frames > 0
    }

    #[must_use]
    pub const fn state(&self) -> SpeechState {
        self.state
    }

    #[must_use]
    pub const fn spec(&self) -> FrameSpec {
        self.spec
    }

    /// Reset run lengths and classifier state (session transition)
    pub fn reset(&mut self) {
        self.reset_counters();
        self.classifier.reset();
    }

    const fn reset_counters(&mut self) {
        self.state = SpeechState {
            consecutive_speech_frames: 0,
            consecutive_silence_frames: 0,
        };
        self.speech_frames = 0;
    }
}
