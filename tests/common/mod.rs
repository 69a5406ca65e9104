//! Shared test utilities
//!
//! Scripted stand-ins for keyword models, the VAD backend, the HTTP
//! collaborators and the speaker, so the session machine can be driven
//! without audio hardware or network access.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use harken::agent::{Exchange, Responder};
use harken::session::{Collaborators, SessionMachine, SessionTiming};
use harken::voice::{
    AudioClip, Frame, FrameSpec, KeywordModel, PlaybackOutcome, PlaybackSink, SpeechClassifier,
    Synthesizer, Transcriber, Utterance, VoiceActivityDetector, Volume, WakeWordDetector,
};
use harken::{Config, Error, Result, SharedSession, StopSignal};

pub const FRAME_LEN: usize = 480;

/// First sample of a frame that the marker model fires on
pub const WAKE_MARKER: i16 = i16::MAX;

#[must_use]
pub fn spec() -> FrameSpec {
    FrameSpec::default()
}

#[must_use]
pub fn wake_frame(index: u64) -> Frame {
    let mut samples = vec![0i16; FRAME_LEN];
    samples[0] = WAKE_MARKER;
    Frame::new(index, samples)
}

#[must_use]
pub fn speech_frame(index: u64) -> Frame {
    Frame::new(index, vec![2_000i16; FRAME_LEN])
}

#[must_use]
pub fn silence_frame(index: u64) -> Frame {
    Frame::new(index, vec![0i16; FRAME_LEN])
}

/// The acknowledgment tone as the microphone hears it: 880 Hz at 0.3
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn cue_frame(index: u64) -> Frame {
    let start = index as usize * FRAME_LEN;
    let samples: Vec<i16> = (start..start + FRAME_LEN)
        .map(|n| {
            let t = n as f32 / 16_000.0;
            (0.3 * (2.0 * std::f32::consts::PI * 880.0 * t).sin() * 32_767.0) as i16
        })
        .collect();
    Frame::new(index, samples)
}

/// Fires when a frame starts with [`WAKE_MARKER`]
pub struct MarkerModel;

impl KeywordModel for MarkerModel {
    fn frame_len(&self) -> usize {
        FRAME_LEN
    }

    fn score(&mut self, frame: &Frame) -> f32 {
        if frame.samples()[0] == WAKE_MARKER { 1.0 } else { 0.0 }
    }

    fn reset(&mut self) {}
}

/// Replays a fixed score per frame index and counts resets
pub struct ScoreModel {
    scores: Vec<f32>,
    pub resets: Arc<AtomicUsize>,
}

impl ScoreModel {
    #[must_use]
    pub fn new(scores: Vec<f32>) -> Self {
        Self {
            scores,
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl KeywordModel for ScoreModel {
    fn frame_len(&self) -> usize {
        FRAME_LEN
    }

    #[allow(clippy::cast_possible_truncation)]
    fn score(&mut self, frame: &Frame) -> f32 {
        self.scores
            .get(frame.index() as usize)
            .copied()
            .unwrap_or(0.0)
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Any non-zero sample is speech
pub struct NonZeroClassifier;

impl SpeechClassifier for NonZeroClassifier {
    fn is_speech(&mut self, samples: &[i16]) -> Result<bool> {
        Ok(samples.iter().any(|&s| s != 0))
    }
}

/// Detector with the marker model armed as "marker"
#[must_use]
pub fn marker_detector() -> WakeWordDetector {
    let mut detector = WakeWordDetector::new(spec());
    detector
        .add_keyword("marker", Box::new(MarkerModel), 0.5)
        .expect("arm marker keyword");
    detector
}

/// Machine with default timing: 66 silence frames, 167 initial, 15 s max
#[must_use]
pub fn machine() -> SessionMachine {
    machine_with(&Config::default(), StopSignal::new())
}

#[must_use]
pub fn machine_with(config: &Config, stop: StopSignal) -> SessionMachine {
    let vad = VoiceActivityDetector::new(Box::new(NonZeroClassifier), spec());
    SessionMachine::new(
        marker_detector(),
        vad,
        SessionTiming::from_config(config),
        SharedSession::new(),
        stop,
    )
    .expect("build machine")
}

/// Scripted behavior of one collaborator call
#[derive(Clone)]
pub enum Script {
    Reply(String),
    Fail,
    Hang,
}

impl Script {
    pub fn reply(text: &str) -> Self {
        Self::Reply(text.to_string())
    }

    async fn run(&self, stage: &str) -> Result<String> {
        match self {
            Self::Reply(text) => Ok(text.clone()),
            Self::Fail => Err(Error::Stt(format!("scripted {stage} failure"))),
            Self::Hang => std::future::pending().await,
        }
    }
}

/// Call log shared between fakes and the test body
#[derive(Clone, Default)]
pub struct Calls {
    pub transcribed: Arc<Mutex<Vec<usize>>>,
    pub requests: Arc<Mutex<Vec<(String, usize)>>>,
    pub synthesized: Arc<Mutex<Vec<String>>>,
    pub played: Arc<Mutex<Vec<Duration>>>,
    pub cues: Arc<AtomicUsize>,
}

impl Calls {
    #[must_use]
    pub fn synthesized(&self) -> Vec<String> {
        self.synthesized.lock().unwrap().clone()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<(String, usize)> {
        self.requests.lock().unwrap().clone()
    }

    #[must_use]
    pub fn transcribed(&self) -> Vec<usize> {
        self.transcribed.lock().unwrap().clone()
    }

    #[must_use]
    pub fn played(&self) -> Vec<Duration> {
        self.played.lock().unwrap().clone()
    }

    #[must_use]
    pub fn cues(&self) -> usize {
        self.cues.load(Ordering::SeqCst)
    }
}

pub struct FakeTranscriber {
    pub script: Script,
    pub calls: Calls,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String> {
        self.calls
            .transcribed
            .lock()
            .unwrap()
            .push(utterance.frame_count());
        self.script.run("transcription").await
    }
}

pub struct FakeResponder {
    pub script: Script,
    pub calls: Calls,
}

#[async_trait]
impl Responder for FakeResponder {
    async fn respond(&self, text: &str, history: &[Exchange]) -> Result<String> {
        self.calls
            .requests
            .lock()
            .unwrap()
            .push((text.to_string(), history.len()));
        self.script.run("response").await
    }
}

/// Renders one second of audio per word at 16 kHz
pub struct FakeSynthesizer {
    pub fail: bool,
    pub calls: Calls,
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioClip> {
        self.calls.synthesized.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(Error::Tts("scripted synthesis failure".to_string()));
        }
        let words = text.split_whitespace().count().max(1);
        Ok(AudioClip::new(vec![0.1; 16_000 * words], 16_000))
    }
}

/// Plays by sleeping for the clip duration, honoring the stop signal
pub struct FakePlayback {
    pub volume: Volume,
    pub calls: Calls,
}

#[async_trait(?Send)]
impl PlaybackSink for FakePlayback {
    async fn play(&mut self, clip: &AudioClip, stop: &StopSignal) -> Result<PlaybackOutcome> {
        self.calls.played.lock().unwrap().push(clip.duration());
        tokio::select! {
            () = stop.requested() => Ok(PlaybackOutcome::Interrupted),
            () = tokio::time::sleep(clip.duration()) => Ok(PlaybackOutcome::Drained),
        }
    }

    fn volume(&self) -> &Volume {
        &self.volume
    }

    fn cue(&mut self) -> Result<()> {
        self.calls.cues.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collaborators following the given scripts, plus their shared call log
#[must_use]
pub fn collaborators(
    config: &Config,
    transcript: Script,
    reply: Script,
) -> (Collaborators, Calls) {
    let calls = Calls::default();
    let collaborators = Collaborators::new(
        config,
        Box::new(FakeTranscriber {
            script: transcript,
            calls: calls.clone(),
        }),
        Box::new(FakeResponder {
            script: reply,
            calls: calls.clone(),
        }),
        Box::new(FakeSynthesizer {
            fail: false,
            calls: calls.clone(),
        }),
        Box::new(FakePlayback {
            volume: Volume::new(70),
            calls: calls.clone(),
        }),
    );
    (collaborators, calls)
}

/// Wake word at `wake`, speech over `speech`, then `silence` quiet frames
///
/// Frames between the wake word and the first speech frame are silent.
#[must_use]
pub fn scenario(wake: u64, speech: std::ops::RangeInclusive<u64>, silence: u64) -> Vec<Frame> {
    let end = *speech.end() + silence;
    (0..=end)
        .map(|i| {
            if i == wake {
                wake_frame(i)
            } else if speech.contains(&i) {
                speech_frame(i)
            } else {
                silence_frame(i)
            }
        })
        .collect()
}
