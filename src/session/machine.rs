//! Frame-driven session state machine
//!
//! ```text
//!   IDLE ──wake word──▶ LISTENING ──next frame──▶ CAPTURING
//!    ▲                                              │
//!    │◀──────── false trigger / stop ───────────────┤
//!    │                                              ▼ end of speech or max duration
//!    └──── drained / failed / stop ── SPEAKING ◀── PROCESSING
//! ```
//!
//! [`SessionMachine::on_frame`] covers IDLE to PROCESSING. The PROCESSING and
//! SPEAKING half runs in [`SessionMachine::complete`] (see `turn.rs`).
//!
//! After a wake word the first [`SessionTiming::cue_frames`] of capture are
//! recorded as silence, so the acknowledgment cue never reaches the VAD.

use std::time::Duration;

use uuid::Uuid;

use super::{SessionState, SharedSession, StopSignal};
use crate::config::Config;
use crate::voice::{
    AppendOutcome, CUE_WINDOW, EndReason, Frame, FrameSpec, Utterance, UtteranceRecorder,
    VoiceActivityDetector, WakeWordDetector,
};
use crate::{Error, Result};

/// Session timing expressed in frames of one geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Consecutive silence frames that end an utterance
    pub silence_threshold_frames: u32,
    /// Frames after the wake word within which speech must start
    pub initial_timeout_frames: u64,
    pub max_utterance: Duration,
    /// Bound on each collaborator call
    pub collaborator_timeout: Duration,
    /// Frames muted at the start of capture while the acknowledgment cue plays
    pub cue_frames: u64,
}

impl SessionTiming {
    /// Convert durations to frame counts for `spec`
    ///
    /// The silence threshold rounds down (2 s of 30 ms frames is 66 frames);
    /// the initial timeout rounds up so it never fires early.
    #[must_use]
    pub fn new(
        spec: FrameSpec,
        silence_duration: Duration,
        initial_timeout: Duration,
        max_utterance: Duration,
        collaborator_timeout: Duration,
    ) -> Self {
        Self {
            silence_threshold_frames: u32::try_from(spec.frames_floor(silence_duration))
                .unwrap_or(u32::MAX)
                .max(1),
            initial_timeout_frames: spec.frames_ceil(initial_timeout).max(1),
            max_utterance,
            collaborator_timeout,
            cue_frames: 0,
        }
    }

    /// Mute the first `window` of capture after a wake word
    #[must_use]
    pub fn with_cue(mut self, spec: FrameSpec, window: Duration) -> Self {
        self.cue_frames = spec.frames_ceil(window);
        self
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let spec = config.frame_spec();
        let timing = Self::new(
            spec,
            config.vad.silence_duration,
            config.session.initial_timeout,
            config.session.max_utterance_duration,
            config.session.collaborator_timeout,
        );
        if config.session.acknowledge {
            timing.with_cue(spec, CUE_WINDOW)
        } else {
            timing
        }
    }
}

/// What one frame did to the session
#[derive(Debug)]
pub enum FrameOutcome {
    /// Idle, no wake word on this frame
    Idle,
    /// A keyword fired; the session is LISTENING
    WakeWord { keyword: usize, frame_index: u64 },
    /// Frame added to the utterance in progress
    Capturing,
    /// Utterance complete; the session is PROCESSING
    Finalized(Utterance),
    /// No speech after the wake word; back to IDLE
    FalseTrigger,
    /// Stop requested; the utterance in progress was discarded
    Cancelled,
    /// Frame arrived while processing or speaking
    Ignored,
}

/// Orchestrates wake word, VAD and recorder into capture episodes
pub struct SessionMachine {
    spec: FrameSpec,
    pub(super) timing: SessionTiming,
    detector: WakeWordDetector,
    vad: VoiceActivityDetector,
    recorder: UtteranceRecorder,
    session: SharedSession,
    pub(super) stop: StopSignal,
    capture_frames: u64,
    /// Leading capture frames to replace with silence
    muted_frames: u64,
    turn: Option<Uuid>,
}

impl SessionMachine {
    /// Build a machine over components sharing one frame geometry
    ///
    /// # Errors
    ///
    /// Returns `FrameSizeMismatch` if the detector and VAD disagree on the
    /// frame geometry
    pub fn new(
        detector: WakeWordDetector,
        vad: VoiceActivityDetector,
        timing: SessionTiming,
        session: SharedSession,
        stop: StopSignal,
    ) -> Result<Self> {
        let spec = detector.spec();
        if vad.spec() != spec {
            return Err(Error::FrameSizeMismatch {
                expected: spec.frame_len(),
                actual: vad.spec().frame_len(),
            });
        }

        session.set(SessionState::Idle);
        Ok(Self {
            spec,
            timing,
            recorder: UtteranceRecorder::new(spec, timing.max_utterance),
            detector,
            vad,
            session,
            stop,
            capture_frames: 0,
            muted_frames: 0,
            turn: None,
        })
    }

    /// Advance the machine by one frame
    ///
    /// A pending stop request is honored before the frame is looked at.
    ///
    /// # Errors
    ///
    /// Returns configuration-class errors (frame size mismatch); transient
    /// classifier errors are logged and the frame counts as silence
    pub fn on_frame(&mut self, frame: Frame) -> Result<FrameOutcome> {
        if self.stop.take() {
            if self.state() != SessionState::Idle {
                self.cancel();
                return Ok(FrameOutcome::Cancelled);
            }
            tracing::debug!("stop requested while idle");
        }

        match self.state() {
            SessionState::Idle => {
                let detection = self.detector.process(&frame)?;
                match detection.keyword_id {
                    Some(keyword) => {
                        self.start_listening(self.timing.cue_frames);
                        Ok(FrameOutcome::WakeWord {
                            keyword,
                            frame_index: detection.frame_index,
                        })
                    }
                    None => Ok(FrameOutcome::Idle),
                }
            }
            SessionState::Listening => {
                self.transition(SessionState::Capturing);
                self.capture(frame)
            }
            SessionState::Capturing => self.capture(frame),
            SessionState::Processing | SessionState::Speaking => Ok(FrameOutcome::Ignored),
        }
    }

    /// Start an utterance without a wake word (single-command mode)
    ///
    /// No cue is played, so nothing is muted.
    pub fn begin_capture(&mut self) {
        self.start_listening(0);
    }

    /// Drop any utterance in progress and return to IDLE
    pub fn cancel(&mut self) {
        tracing::info!(
            turn = ?self.turn,
            state = %self.state(),
            frames = self.recorder.len(),
            "session cancelled"
        );
        self.recorder.discard();
        self.vad.reset();
        self.detector.reset();
        self.turn = None;
        self.transition(SessionState::Idle);
    }

    fn start_listening(&mut self, muted_frames: u64) {
        let turn = Uuid::new_v4();
        self.turn = Some(turn);
        self.transition(SessionState::Listening);
        self.recorder.begin();
        self.vad.reset();
        self.capture_frames = 0;
        self.muted_frames = muted_frames;
        tracing::debug!(turn = %turn, muted = muted_frames, "listening for utterance");
    }

    fn capture(&mut self, frame: Frame) -> Result<FrameOutcome> {
        self.capture_frames += 1;

        // The microphone hears the cue; neither the VAD nor the recording may
        let (frame, is_speech) = if self.capture_frames <= self.muted_frames {
            if frame.len() != self.spec.frame_len() {
                return Err(Error::InvalidFrameSize {
                    expected: self.spec.frame_len(),
                    actual: frame.len(),
                });
            }
            (Frame::new(frame.index(), vec![0i16; frame.len()]), false)
        } else {
            let is_speech = match self.vad.classify(&frame) {
                Ok(is_speech) => is_speech,
                Err(e) if e.is_config() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, frame = frame.index(), "VAD failed, treating frame as silence");
                    false
                }
            };
            (frame, is_speech)
        };
        self.vad.update_run_lengths(is_speech);
        let appended = self.recorder.append(frame);

        if self.vad.is_utterance_end(self.timing.silence_threshold_frames) {
            return Ok(self.finalize(EndReason::EndOfSpeech));
        }

        match appended {
            AppendOutcome::Accepted => {}
            AppendOutcome::Filled | AppendOutcome::Rejected => {
                tracing::warn!(
                    turn = ?self.turn,
                    max_ms = self.timing.max_utterance.as_millis(),
                    "utterance hit max duration, forwarding partial audio"
                );
                return Ok(self.finalize(EndReason::MaxDuration));
            }
        }

        if !self.vad.has_speech() && self.capture_frames >= self.timing.initial_timeout_frames {
            tracing::info!(
                turn = ?self.turn,
                frames = self.capture_frames,
                "no speech after wake word, discarding"
            );
            self.recorder.discard();
            self.vad.reset();
            self.turn = None;
            self.transition(SessionState::Idle);
            return Ok(FrameOutcome::FalseTrigger);
        }

        Ok(FrameOutcome::Capturing)
    }

    fn finalize(&mut self, reason: EndReason) -> FrameOutcome {
        let utterance = self.recorder.finalize(reason);
        self.vad.reset();
        self.transition(SessionState::Processing);

        tracing::info!(
            turn = ?self.turn,
            frames = utterance.frame_count(),
            duration_ms = utterance.duration().as_millis(),
            reason = %reason,
            "utterance captured"
        );
        FrameOutcome::Finalized(utterance)
    }

    /// Close the turn and return to IDLE
    ///
    /// [`SessionMachine::complete`] calls this itself; offline tools that
    /// only segment audio call it after each finalized utterance.
    pub fn finish_turn(&mut self) {
        self.detector.reset();
        self.turn = None;
        self.transition(SessionState::Idle);
    }

    pub(super) fn transition(&self, to: SessionState) {
        let from = self.session.set(to);
        if from != to {
            tracing::debug!(from = %from, to = %to, turn = ?self.turn, "session transition");
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    #[must_use]
    pub const fn session(&self) -> &SharedSession {
        &self.session
    }

    #[must_use]
    pub const fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    #[must_use]
    pub const fn detector(&self) -> &WakeWordDetector {
        &self.detector
    }

    #[must_use]
    pub const fn timing(&self) -> SessionTiming {
        self.timing
    }

    #[must_use]
    pub const fn spec(&self) -> FrameSpec {
        self.spec
    }

    /// Id of the capture episode in progress, for log correlation
    #[must_use]
    pub const fn turn_id(&self) -> Option<Uuid> {
        self.turn
    }
}
