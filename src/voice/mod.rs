//! Voice processing module
//!
//! Handles audio capture, framing, wake word detection, voice activity
//! detection, utterance recording, STT, TTS and playback.

mod capture;
mod devices;
mod frame;
mod mfcc;
mod playback;
mod recorder;
mod resample;
mod ring_buffer;
mod stt;
mod tts;
mod vad;
mod wake_word;
mod wav;

pub use capture::{CpalFrameSource, FrameAssembler, FrameSource};
pub use devices::{DeviceInfo, list_input_devices, list_output_devices};
pub use frame::{
    Frame, FrameSpec, SUPPORTED_FRAME_DURATIONS_MS, SUPPORTED_SAMPLE_RATES, f32_to_i16,
    i16_to_f32, rms_i16,
};
pub use playback::{
    AudioClip, CUE_WINDOW, CpalPlayback, PlaybackOutcome, PlaybackSink, Volume, decode_audio, decode_mp3,
};
pub use recorder::{AppendOutcome, EndReason, Utterance, UtteranceRecorder};
pub use resample::{StreamResampler, resample};
pub use ring_buffer::{FrameRead, FrameReader, RingBuffer};
pub use stt::{SpeechToText, Transcriber};
pub use tts::{Synthesizer, TextToSpeech};
pub use vad::{EnergyClassifier, SpeechClassifier, SpeechState, VoiceActivityDetector, WebRtcClassifier};
pub use wake_word::{
    DetectionResult, DetectionStats, KeywordModel, Sensitivity, TemplateModel, WakeWordDetector,
};
pub use wav::{decode_wav, read_wav_mono, samples_to_wav, write_wav_file};
