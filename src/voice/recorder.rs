//! Bounded accumulation of the frames of one utterance

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::frame::{Frame, FrameSpec};

/// Why an utterance stopped growing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Trailing silence after speech
    EndOfSpeech,
    /// Hit the maximum utterance duration
    MaxDuration,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndOfSpeech => write!(f, "end of speech"),
            Self::MaxDuration => write!(f, "max duration"),
        }
    }
}

/// The audio of one capture episode
#[derive(Debug, Clone)]
pub struct Utterance {
    frames: Vec<Frame>,
    spec: FrameSpec,
    started_at: DateTime<Utc>,
    end_reason: EndReason,
}

impl Utterance {
    /// Assemble an utterance from frames already in stream order
    #[must_use]
    pub fn new(frames: Vec<Frame>, spec: FrameSpec, end_reason: EndReason) -> Self {
        Self {
            frames,
            spec,
            started_at: Utc::now(),
            end_reason,
        }
    }

    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.spec.sample_rate()
    }

    #[must_use]
    pub const fn end_reason(&self) -> EndReason {
        self.end_reason
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Index of the first and last frame, if any
    #[must_use]
    pub fn span(&self) -> Option<(u64, u64)> {
        Some((self.frames.first()?.index(), self.frames.last()?.index()))
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.spec.duration_of(self.frames.len() as u64)
    }

    /// Contiguous PCM of the whole utterance
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        let mut samples = Vec::with_capacity(self.frames.len() * self.spec.frame_len());
        for frame in &self.frames {
            samples.extend_from_slice(frame.samples());
        }
        samples
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Result of offering a frame to the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored; there is room for more
    Accepted,
    /// Stored, and the recorder is now full
    Filled,
    /// Not stored: the recorder is full or not recording
    Rejected,
}

/// Accumulates frames for one utterance up to a fixed bound
pub struct UtteranceRecorder {
    spec: FrameSpec,
    max_frames: usize,
    frames: Vec<Frame>,
    started_at: Option<DateTime<Utc>>,
}

impl UtteranceRecorder {
    /// Recorder bounded to `max_duration`, rounded up to a whole frame
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(spec: FrameSpec, max_duration: Duration) -> Self {
        let max_frames = spec.frames_ceil(max_duration).max(1) as usize;
        Self {
            spec,
            max_frames,
            frames: Vec::new(),
            started_at: None,
        }
    }

    /// Start a new, empty utterance, dropping anything in progress
    pub fn begin(&mut self) {
        if !self.frames.is_empty() {
            tracing::debug!(frames = self.frames.len(), "discarding unfinished utterance");
        }
        self.frames.clear();
        self.frames.reserve(self.max_frames);
        self.started_at = Some(Utc::now());
    }

    /// Offer a frame to the active utterance
    pub fn append(&mut self, frame: Frame) -> AppendOutcome {
        if self.started_at.is_none() || self.is_full() {
            return AppendOutcome::Rejected;
        }

        self.frames.push(frame);
        if self.is_full() {
            AppendOutcome::Filled
        } else {
            AppendOutcome::Accepted
        }
    }

    /// Hand off the recorded utterance and stop recording
    pub fn finalize(&mut self, end_reason: EndReason) -> Utterance {
        let started_at = self.started_at.take().unwrap_or_else(Utc::now);
        Utterance {
            frames: std::mem::take(&mut self.frames),
            spec: self.spec,
            started_at,
            end_reason,
        }
    }

    /// Drop the recorded frames and stop recording
    pub fn discard(&mut self) {
        self.frames.clear();
        self.started_at = None;
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.max_frames
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.started_at.is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub const fn max_frames(&self) -> usize {
        self.max_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(index: u64) -> Frame {
        Frame::new(index, vec![0i16; 480])
    }

    #[test]
    fn rejects_appends_before_begin() {
        let mut recorder = UtteranceRecorder::new(FrameSpec::default(), Duration::from_secs(1));
        assert_eq!(recorder.append(frame(0)), AppendOutcome::Rejected);
        assert!(recorder.is_empty());
    }

    #[test]
    fn bound_is_exact_to_one_frame() {
        // 300 ms at 30 ms frames is exactly 10 frames
        let mut recorder =
            UtteranceRecorder::new(FrameSpec::default(), Duration::from_millis(300));
        recorder.begin();

        for i in 0..9 {
            assert_eq!(recorder.append(frame(i)), AppendOutcome::Accepted);
        }
        assert_eq!(recorder.append(frame(9)), AppendOutcome::Filled);
        assert!(recorder.is_full());
        assert_eq!(recorder.append(frame(10)), AppendOutcome::Rejected);

        let utterance = recorder.finalize(EndReason::MaxDuration);
        assert_eq!(utterance.frame_count(), 10);
        assert_eq!(utterance.duration(), Duration::from_millis(300));
        assert_eq!(utterance.span(), Some((0, 9)));
        assert_eq!(utterance.end_reason(), EndReason::MaxDuration);
    }

    #[test]
    fn partial_frame_durations_round_up() {
        let recorder = UtteranceRecorder::new(FrameSpec::default(), Duration::from_millis(310));
        assert_eq!(recorder.max_frames(), 11);
    }

    #[test]
    fn finalize_stops_recording() {
        let mut recorder = UtteranceRecorder::new(FrameSpec::default(), Duration::from_secs(1));
        recorder.begin();
        recorder.append(frame(0));
        let utterance = recorder.finalize(EndReason::EndOfSpeech);
        assert_eq!(utterance.samples().len(), 480);
        assert!(!recorder.is_recording());
        assert_eq!(recorder.append(frame(1)), AppendOutcome::Rejected);
    }

    #[test]
    fn discard_drops_frames() {
        let mut recorder = UtteranceRecorder::new(FrameSpec::default(), Duration::from_secs(1));
        recorder.begin();
        recorder.append(frame(0));
        recorder.discard();
        assert!(recorder.is_empty());
        assert!(!recorder.is_recording());
    }
}
