//! MFCC feature extraction and DTW distance for keyword templates
//!
//! 25 ms Hann windows every 10 ms, a mel filterbank over the power spectrum,
//! log energies and a DCT-II. Works at any pipeline sample rate.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Number of MFCC coefficients per feature frame
pub const NUM_MFCC: usize = 13;

/// Number of mel filters
const NUM_MEL_FILTERS: usize = 26;

/// Analysis window length in milliseconds
const WINDOW_MS: u32 = 25;

/// Hop between windows in milliseconds
const HOP_MS: u32 = 10;

/// One MFCC vector
pub type Features = Vec<f32>;

/// Computes MFCC vectors from mono float audio
pub struct MfccExtractor {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    filterbank: Vec<Vec<f32>>,
    hop: usize,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl MfccExtractor {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(sample_rate: u32) -> Self {
        let window_len = (sample_rate * WINDOW_MS / 1000) as usize;
        let hop = (sample_rate * HOP_MS / 1000) as usize;

        let fft = FftPlanner::<f32>::new().plan_fft_forward(window_len);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        let window = (0..window_len)
            .map(|n| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * n as f32 / (window_len - 1) as f32).cos())
            })
            .collect();

        Self {
            fft,
            window,
            filterbank: build_mel_filterbank(NUM_MEL_FILTERS, window_len, sample_rate),
            hop,
            buffer: vec![Complex::new(0.0, 0.0); window_len],
            scratch,
        }
    }

    /// Samples per analysis window
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Samples between consecutive windows
    #[must_use]
    pub const fn hop(&self) -> usize {
        self.hop
    }

    /// Features of one window of exactly `window_len` samples
    #[allow(clippy::cast_precision_loss)]
    pub fn window_features(&mut self, samples: &[f32]) -> Features {
        for ((slot, &s), &w) in self.buffer.iter_mut().zip(samples).zip(&self.window) {
            *slot = Complex::new(s * w, 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let n = self.window.len();
        let power: Vec<f32> = self.buffer[..=n / 2]
            .iter()
            .map(|c| c.norm_sqr() / n as f32)
            .collect();

        let mel_energies: Vec<f32> = self
            .filterbank
            .iter()
            .map(|filter| {
                let energy: f32 = filter.iter().zip(&power).map(|(&f, &p)| f * p).sum();
                energy.max(1e-10).ln()
            })
            .collect();

        dct_ii(&mel_energies, NUM_MFCC)
    }

    /// Features of every complete window in `samples`
    pub fn extract(&mut self, samples: &[f32]) -> Vec<Features> {
        let window_len = self.window_len();
        if samples.len() < window_len {
            return Vec::new();
        }

        let count = (samples.len() - window_len) / self.hop + 1;
        (0..count)
            .map(|i| {
                let start = i * self.hop;
                self.window_features(&samples[start..start + window_len])
            })
            .collect()
    }
}

/// Subtract the per-coefficient mean across a sequence
pub fn normalize_mean(features: &mut [Features]) {
    let Some(first) = features.first() else {
        return;
    };
    let mut mean = vec![0.0f32; first.len()];
    for frame in features.iter() {
        for (m, &v) in mean.iter_mut().zip(frame) {
            *m += v;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let count = features.len() as f32;
    for m in &mut mean {
        *m /= count;
    }
    for frame in features.iter_mut() {
        for (v, &m) in frame.iter_mut().zip(&mean) {
            *v -= m;
        }
    }
}

/// DTW distance between two feature sequences, normalized by path length
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn dtw_distance(input: &[Features], reference: &[Features]) -> f32 {
    let n = input.len();
    let m = reference.len();
    if n == 0 || m == 0 {
        return f32::MAX;
    }

    let width = m + 1;
    let mut cost = vec![f32::MAX; (n + 1) * width];
    cost[0] = 0.0;

    for i in 1..=n {
        for j in 1..=m {
            let d = euclidean_distance(&input[i - 1], &reference[j - 1]);
            let prev = cost[(i - 1) * width + j]
                .min(cost[i * width + j - 1])
                .min(cost[(i - 1) * width + j - 1]);
            cost[i * width + j] = d + prev;
        }
    }

    cost[n * width + m] / (n + m) as f32
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn build_mel_filterbank(num_filters: usize, fft_size: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let power_len = fft_size / 2 + 1;
    let low_mel = hz_to_mel(0.0);
    let high_mel = hz_to_mel(sample_rate as f32 / 2.0);

    let num_points = num_filters + 2;
    let bins: Vec<usize> = (0..num_points)
        .map(|i| {
            let mel = low_mel + (high_mel - low_mel) * i as f32 / (num_points - 1) as f32;
            ((fft_size as f32 + 1.0) * mel_to_hz(mel) / sample_rate as f32).floor() as usize
        })
        .collect();

    (0..num_filters)
        .map(|m| {
            let (left, center, right) = (bins[m], bins[m + 1], bins[m + 2]);
            let mut filter = vec![0.0f32; power_len];
            for (i, val) in filter.iter_mut().enumerate() {
                if i >= left && i < center && center > left {
                    *val = (i - left) as f32 / (center - left) as f32;
                } else if i >= center && i <= right && right > center {
                    *val = (right - i) as f32 / (right - center) as f32;
                }
            }
            filter
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn dct_ii(input: &[f32], num_coeffs: usize) -> Features {
    let n = input.len() as f32;
    (0..num_coeffs)
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    v * (std::f32::consts::PI * k as f32 * (2 * i + 1) as f32 / (2.0 * n)).cos()
                })
                .sum()
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn tone(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn window_geometry_follows_sample_rate() {
        let at_16k = MfccExtractor::new(16_000);
        assert_eq!(at_16k.window_len(), 400);
        assert_eq!(at_16k.hop(), 160);

        let at_8k = MfccExtractor::new(8_000);
        assert_eq!(at_8k.window_len(), 200);
        assert_eq!(at_8k.hop(), 80);
    }

    #[test]
    fn mel_filterbank_shape() {
        let fb = build_mel_filterbank(NUM_MEL_FILTERS, 400, 16_000);
        assert_eq!(fb.len(), NUM_MEL_FILTERS);
        for filter in &fb {
            assert_eq!(filter.len(), 201);
            assert!(filter.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn dct_dc_coefficient_is_sum() {
        let result = dct_ii(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(result.len(), 3);
        assert!((result[0] - 10.0).abs() < 0.01);
    }

    #[test]
    fn extract_counts_windows() {
        let mut mfcc = MfccExtractor::new(16_000);
        assert!(mfcc.extract(&[0.0; 399]).is_empty());
        // 1 s of audio: (16000 - 400) / 160 + 1 windows
        let features = mfcc.extract(&tone(440.0, 16_000));
        assert_eq!(features.len(), 98);
        assert!(features.iter().all(|f| f.len() == NUM_MFCC));
    }

    #[test]
    fn dtw_identical_sequences_is_zero() {
        let mut mfcc = MfccExtractor::new(16_000);
        let features = mfcc.extract(&tone(440.0, 8_000));
        assert!(dtw_distance(&features, &features).abs() < 1e-4);
    }

    #[test]
    fn dtw_prefers_matching_tone() {
        let mut mfcc = MfccExtractor::new(16_000);
        let reference = mfcc.extract(&tone(440.0, 8_000));
        let same = mfcc.extract(&tone(440.0, 9_000));
        let other = mfcc.extract(&tone(2_000.0, 9_000));
        assert!(dtw_distance(&same, &reference) < dtw_distance(&other, &reference));
    }

    #[test]
    fn dtw_empty_is_max() {
        assert!((dtw_distance(&[], &[vec![0.0; NUM_MFCC]]) - f32::MAX).abs() < f32::EPSILON);
    }

    #[test]
    fn mean_normalization_centers_coefficients() {
        let mut features = vec![vec![1.0, 2.0], vec![3.0, 6.0]];
        normalize_mean(&mut features);
        assert_eq!(features, vec![vec![-1.0, -2.0], vec![1.0, 2.0]]);
    }
}
