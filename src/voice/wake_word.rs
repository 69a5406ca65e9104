//! Wake word detection
//!
//! The detector owns one [`KeywordModel`] per armed keyword. A model is an
//! opaque context that may remember previous frames, so feeding the same
//! frame twice can produce different scores. Every model sees every frame;
//! a keyword fires when its score rises above `1 - sensitivity`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::frame::{Frame, FrameSpec, i16_to_f32};
use super::mfcc::{self, Features, MfccExtractor};
use crate::config::WakeWordConfig;
use crate::{Error, Result};

/// Per-frame keyword scorer with its own acoustic context
pub trait KeywordModel {
    /// Samples per frame this model consumes
    fn frame_len(&self) -> usize;

    /// Score in [0.0, 1.0] that the keyword just ended at this frame
    fn score(&mut self, frame: &Frame) -> f32;

    /// Forget all acoustic context
    fn reset(&mut self);
}

/// Decision for a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionResult {
    pub frame_index: u64,
    pub is_wake_word: bool,
    pub keyword_id: Option<usize>,
}

/// Shared, runtime-adjustable sensitivity in [0.0, 1.0]
///
/// Clones share the same value; updates apply from the next frame.
#[derive(Debug, Clone)]
pub struct Sensitivity(Arc<AtomicU32>);

impl Sensitivity {
    #[must_use]
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(value.clamp(0.0, 1.0).to_bits())))
    }

    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Set the sensitivity, clamped to [0.0, 1.0]
    pub fn set(&self, value: f32) {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Score a keyword must exceed to fire
    #[must_use]
    pub fn threshold(&self) -> f32 {
        1.0 - self.get()
    }
}

struct ArmedKeyword {
    name: String,
    sensitivity: Sensitivity,
    model: Box<dyn KeywordModel>,
    detections: u64,
}

/// Per-keyword detection counters
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionStats {
    pub frames_processed: u64,
    pub detections: Vec<(String, u64)>,
    pub uptime: Duration,
}

impl DetectionStats {
    #[must_use]
    pub fn total_detections(&self) -> u64 {
        self.detections.iter().map(|(_, n)| n).sum()
    }
}

/// Multi-keyword wake word detector
pub struct WakeWordDetector {
    spec: FrameSpec,
    keywords: Vec<ArmedKeyword>,
    frames_processed: u64,
    started: Instant,
}

impl WakeWordDetector {
    /// Create a detector with no keywords armed
    #[must_use]
    pub fn new(spec: FrameSpec) -> Self {
        Self {
            spec,
            keywords: Vec::new(),
            frames_processed: 0,
            started: Instant::now(),
        }
    }

    /// Build a detector with template models from configuration
    ///
    /// # Errors
    ///
    /// Returns error if a keyword reference cannot be loaded
    pub fn from_config(config: &WakeWordConfig, spec: FrameSpec) -> Result<Self> {
        let mut detector = Self::new(spec);
        for keyword in &config.keywords {
            let model = TemplateModel::load(&keyword.name, &keyword.model, spec)?;
            detector.add_keyword(&keyword.name, Box::new(model), keyword.sensitivity)?;
        }
        Ok(detector)
    }

    /// Arm a keyword; returns its id (position in arming order)
    ///
    /// # Errors
    ///
    /// Returns `FrameSizeMismatch` if the model consumes a different frame
    /// length, or a configuration error for a duplicate name or an
    /// out-of-range sensitivity
    pub fn add_keyword(
        &mut self,
        name: &str,
        model: Box<dyn KeywordModel>,
        sensitivity: f32,
    ) -> Result<usize> {
        let expected = self.spec.frame_len();
        if model.frame_len() != expected {
            return Err(Error::FrameSizeMismatch {
                expected,
                actual: model.frame_len(),
            });
        }
        if !(0.0..=1.0).contains(&sensitivity) {
            return Err(Error::Config(format!(
                "sensitivity for '{name}' must be within 0.0-1.0, got {sensitivity}"
            )));
        }
        if self.keywords.iter().any(|k| k.name == name) {
            return Err(Error::Config(format!("keyword '{name}' armed twice")));
        }

        tracing::info!(keyword = name, sensitivity, "wake word armed");
        self.keywords.push(ArmedKeyword {
            name: name.to_string(),
            sensitivity: Sensitivity::new(sensitivity),
            model,
            detections: 0,
        });
        Ok(self.keywords.len() - 1)
    }

    /// Score one frame against every armed keyword
    ///
    /// The first keyword (in arming order) whose score exceeds its threshold
    /// wins. After a detection every model's context is cleared.
    ///
    /// # Errors
    ///
    /// Returns `FrameSizeMismatch` if the frame has the wrong length
    pub fn process(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let expected = self.spec.frame_len();
        if frame.len() != expected {
            return Err(Error::FrameSizeMismatch {
                expected,
                actual: frame.len(),
            });
        }

        self.frames_processed += 1;
        let mut fired = None;
        for (id, keyword) in self.keywords.iter_mut().enumerate() {
            let score = keyword.model.score(frame);
            if fired.is_none() && score > keyword.sensitivity.threshold() {
                fired = Some(id);
            }
        }

        if let Some(id) = fired {
            let keyword = &mut self.keywords[id];
            keyword.detections += 1;
            tracing::info!(
                keyword = %keyword.name,
                frame = frame.index(),
                "wake word detected"
            );
            self.reset();
        }

        Ok(DetectionResult {
            frame_index: frame.index(),
            is_wake_word: fired.is_some(),
            keyword_id: fired,
        })
    }

    /// Clear every model's acoustic context
    pub fn reset(&mut self) {
        for keyword in &mut self.keywords {
            keyword.model.reset();
        }
    }

    #[must_use]
    pub fn keyword_name(&self, id: usize) -> Option<&str> {
        self.keywords.get(id).map(|k| k.name.as_str())
    }

    /// Handle to a keyword's sensitivity, for runtime adjustment
    #[must_use]
    pub fn sensitivity(&self, id: usize) -> Option<Sensitivity> {
        self.keywords.get(id).map(|k| k.sensitivity.clone())
    }

    #[must_use]
    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    #[must_use]
    pub const fn spec(&self) -> FrameSpec {
        self.spec
    }

    #[must_use]
    pub fn stats(&self) -> DetectionStats {
        DetectionStats {
            frames_processed: self.frames_processed,
            detections: self
                .keywords
                .iter()
                .map(|k| (k.name.clone(), k.detections))
                .collect(),
            uptime: self.started.elapsed(),
        }
    }
}

/// RMS below which a window is treated as silence and not scored
const QUIET_FLOOR: f32 = 0.01;

/// DTW distance that maps to a score of 0.5
const DISTANCE_SCALE: f32 = 10.0;

/// Template matching model: MFCC features of reference recordings compared
/// against the recent audio with dynamic time warping
pub struct TemplateModel {
    frame_len: usize,
    references: Vec<Vec<Features>>,
    extractor: MfccExtractor,
    /// Samples not yet covered by a complete analysis window
    pending: Vec<f32>,
    features: VecDeque<Features>,
    /// Per-frame RMS over the span the feature window covers
    levels: VecDeque<f32>,
    max_features: usize,
    min_features: usize,
    level_frames: usize,
}

impl TemplateModel {
    /// Build a model from reference sample buffers at the pipeline rate
    ///
    /// # Errors
    ///
    /// Returns error if no reference is long enough to yield features
    pub fn from_samples(name: &str, references: &[Vec<f32>], spec: FrameSpec) -> Result<Self> {
        let mut extractor = MfccExtractor::new(spec.sample_rate());
        let references: Vec<Vec<Features>> = references
            .iter()
            .map(|samples| {
                let mut features = extractor.extract(samples);
                mfcc::normalize_mean(&mut features);
                features
            })
            .filter(|f| !f.is_empty())
            .collect();

        let longest = references.iter().map(Vec::len).max().ok_or_else(|| {
            Error::KeywordModel {
                name: name.to_string(),
                reason: "no usable reference recordings".to_string(),
            }
        })?;
        let shortest = references.iter().map(Vec::len).min().unwrap_or(longest);

        // Window spans the longest reference plus a quarter for timing slack
        let max_features = longest + longest / 4;
        let covered_samples = max_features * extractor.hop() + extractor.window_len();
        let level_frames = covered_samples.div_ceil(spec.frame_len());

        Ok(Self {
            frame_len: spec.frame_len(),
            pending: Vec::with_capacity(spec.frame_len() + extractor.window_len()),
            extractor,
            references,
            features: VecDeque::with_capacity(max_features + 1),
            levels: VecDeque::with_capacity(level_frames + 1),
            max_features,
            min_features: shortest,
            level_frames,
        })
    }

    /// Load reference recordings from a WAV file or a directory of WAVs
    ///
    /// Recordings at another sample rate are resampled to the pipeline rate.
    ///
    /// # Errors
    ///
    /// Returns `KeywordModel` if the path holds no readable recording
    pub fn load(name: &str, path: &Path, spec: FrameSpec) -> Result<Self> {
        let model_error = |reason: String| Error::KeywordModel {
            name: name.to_string(),
            reason,
        };

        let files = if path.is_dir() {
            let mut files: Vec<_> = std::fs::read_dir(path)
                .map_err(|e| model_error(format!("cannot read {}: {e}", path.display())))?
                .filter_map(std::result::Result::ok)
                .map(|entry| entry.path())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
                })
                .collect();
            files.sort();
            files
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(model_error(format!("{} does not exist", path.display())));
        };

        let mut references = Vec::with_capacity(files.len());
        for file in &files {
            let samples = super::wav::read_wav_mono(file, spec.sample_rate())
                .map_err(|e| model_error(format!("{}: {e}", file.display())))?;
            tracing::debug!(keyword = name, path = %file.display(), "loaded reference");
            references.push(samples);
        }

        let model = Self::from_samples(name, &references, spec)?;
        tracing::info!(keyword = name, references = model.references.len(), "keyword model loaded");
        Ok(model)
    }

    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    fn is_quiet(&self) -> bool {
        self.levels.iter().all(|&l| l < QUIET_FLOOR)
    }
}

impl KeywordModel for TemplateModel {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn score(&mut self, frame: &Frame) -> f32 {
        self.levels.push_back(frame.rms());
        while self.levels.len() > self.level_frames {
            self.levels.pop_front();
        }

        self.pending
            .extend(frame.samples().iter().map(|&s| i16_to_f32(s)));
        let window_len = self.extractor.window_len();
        let hop = self.extractor.hop();
        let mut consumed = 0;
        while self.pending.len() - consumed >= window_len {
            let features = self
                .extractor
                .window_features(&self.pending[consumed..consumed + window_len]);
            self.features.push_back(features);
            consumed += hop;
        }
        self.pending.drain(..consumed);
        while self.features.len() > self.max_features {
            self.features.pop_front();
        }

        if self.features.len() < self.min_features || self.is_quiet() {
            return 0.0;
        }

        let mut best = 0.0f32;
        for reference in &self.references {
            let take = (reference.len() + reference.len() / 4).min(self.features.len());
            let mut window: Vec<Features> = self
                .features
                .iter()
                .skip(self.features.len() - take)
                .cloned()
                .collect();
            mfcc::normalize_mean(&mut window);
            let distance = mfcc::dtw_distance(&window, reference);
            best = best.max(1.0 / (1.0 + distance / DISTANCE_SCALE));
        }
        best
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.features.clear();
        self.levels.clear();
    }
}
