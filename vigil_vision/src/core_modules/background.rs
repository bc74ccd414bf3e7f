// THEORY:
// The `background` module provides the operator that turns a raw `Frame` into a
// `ForegroundMask`. The pipeline treats it as an opaque collaborator behind the
// `BackgroundSubtractor` trait: anything that learns a model of the static scene
// and reports per-pixel change can be plugged in (the runner swaps in OpenCV's
// MOG2/KNN when built with the `opencv` feature).
//
// Two pure-Rust operators are provided, matching the two selectable modes:
// 1.  **Adaptive** (`AdaptiveSubtractor`): one running Gaussian per pixel with an
//     automatically decaying learning rate. Higher variance, adapts quickly to
//     gradual lighting change. Also marks cast shadows with the `SHADOW` value.
// 2.  **Nearest-neighbor** (`NearestNeighborSubtractor`): a bag of recent color
//     samples per pixel; a pixel is background when enough samples lie close to
//     it. More robust to multi-modal backgrounds (foliage, flicker).
//
// Both operators learn on every call. There is no frozen mode: a parked object
// is absorbed into the background after roughly `history` frames.

use crate::core_modules::frame::{BACKGROUND, FOREGROUND, ForegroundMask, Frame, SHADOW};
use crate::error::{VisionError, VisionResult};
use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

/// The external contract for background subtraction.
pub trait BackgroundSubtractor {
    /// Classifies every pixel of `frame` and folds the frame into the
    /// background model.
    fn apply(&mut self, frame: &Frame) -> VisionResult<ForegroundMask>;
}

/// Selectable background algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    Adaptive,
    NearestNeighbor,
}

impl FromStr for AlgorithmKind {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adaptive" | "mog2" => Ok(Self::Adaptive),
            "nearest-neighbor" | "nearest_neighbor" | "knn" => Ok(Self::NearestNeighbor),
            other => Err(VisionError::InvalidConfig(format!(
                "unknown background algorithm '{other}' (expected adaptive or nearest-neighbor)"
            ))),
        }
    }
}

/// Builds the pure-Rust operator for the selected algorithm.
pub fn create_subtractor(kind: AlgorithmKind) -> Box<dyn BackgroundSubtractor> {
    match kind {
        AlgorithmKind::Adaptive => Box::new(AdaptiveSubtractor::new(AdaptiveParams::default())),
        AlgorithmKind::NearestNeighbor => Box::new(NearestNeighborSubtractor::new(
            NearestNeighborParams::default(),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveParams {
    /// Number of frames the automatic learning rate converges to.
    pub history: u64,
    /// Threshold on the squared Mahalanobis distance.
    pub var_threshold: f32,
    pub var_init: f32,
    pub var_min: f32,
    pub var_max: f32,
    /// Mark shadows instead of foreground when a pixel is a darker copy of the background.
    pub detect_shadows: bool,
    /// Minimum brightness ratio for a shadow.
    pub shadow_tau: f32,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            history: 500,
            var_threshold: 40.0,
            var_init: 15.0,
            var_min: 4.0,
            var_max: 75.0,
            detect_shadows: true,
            shadow_tau: 0.5,
        }
    }
}

/// Per-pixel running Gaussian model.
pub struct AdaptiveSubtractor {
    params: AdaptiveParams,
    dimensions: (u32, u32),
    mean: Vec<[f32; 3]>,
    variance: Vec<f32>,
    frames_seen: u64,
}

impl AdaptiveSubtractor {
    pub fn new(params: AdaptiveParams) -> Self {
        Self {
            params,
            dimensions: (0, 0),
            mean: Vec::new(),
            variance: Vec::new(),
            frames_seen: 0,
        }
    }

    fn initialize(&mut self, frame: &Frame) {
        self.dimensions = frame.dimensions();
        self.mean = frame
            .image
            .pixels()
            .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
            .collect();
        self.variance = vec![self.params.var_init; self.mean.len()];
        self.frames_seen = 1;
    }

    /// `1 / min(2n, history)` where `n` counts frames since initialization.
    fn learning_rate(&self) -> f32 {
        let window = (2 * self.frames_seen).min(self.params.history).max(1);
        1.0 / window as f32
    }

    fn is_shadow(&self, pixel: [f32; 3], mean: [f32; 3], variance: f32) -> bool {
        let numerator: f32 = (0..3).map(|c| pixel[c] * mean[c]).sum();
        let denominator: f32 = (0..3).map(|c| mean[c] * mean[c]).sum();
        if denominator <= f32::EPSILON {
            return false;
        }
        let ratio = numerator / denominator;
        if ratio > 1.0 || ratio < self.params.shadow_tau {
            return false;
        }
        let distortion: f32 = (0..3).map(|c| (ratio * mean[c] - pixel[c]).powi(2)).sum();
        distortion < self.params.var_threshold * variance * ratio * ratio
    }
}

impl BackgroundSubtractor for AdaptiveSubtractor {
    fn apply(&mut self, frame: &Frame) -> VisionResult<ForegroundMask> {
        let (width, height) = frame.dimensions();
        if self.frames_seen == 0 || self.dimensions != (width, height) {
            self.initialize(frame);
            return Ok(ForegroundMask::empty(width, height));
        }

        self.frames_seen += 1;
        let alpha = self.learning_rate();
        let mut cells = GrayImage::new(width, height);

        for (i, (pixel, cell)) in frame.image.pixels().zip(cells.pixels_mut()).enumerate() {
            let value = [pixel[0] as f32, pixel[1] as f32, pixel[2] as f32];
            let mean = self.mean[i];
            let variance = self.variance[i];
            let delta = [value[0] - mean[0], value[1] - mean[1], value[2] - mean[2]];
            let dist2: f32 = delta.iter().map(|d| d * d).sum();

            let label = if dist2 < self.params.var_threshold * variance {
                BACKGROUND
            } else if self.params.detect_shadows && self.is_shadow(value, mean, variance) {
                SHADOW
            } else {
                FOREGROUND
            };
            *cell = Luma([label]);

            for c in 0..3 {
                self.mean[i][c] += alpha * delta[c];
            }
            self.variance[i] = (variance + alpha * (dist2 - variance))
                .clamp(self.params.var_min, self.params.var_max);
        }

        Ok(ForegroundMask::new(cells))
    }
}

#[derive(Debug, Clone)]
pub struct NearestNeighborParams {
    pub history: u64,
    /// Samples kept per pixel.
    pub samples: usize,
    /// Close samples needed for a pixel to count as background.
    pub required_matches: usize,
    /// Squared RGB distance under which a sample is "close".
    pub dist2_threshold: f32,
    pub seed: u64,
}

impl Default for NearestNeighborParams {
    fn default() -> Self {
        Self {
            history: 500,
            samples: 7,
            required_matches: 2,
            dist2_threshold: 400.0,
            seed: 0x5eed,
        }
    }
}

/// Sample-based background model: each pixel keeps a small set of past colors.
pub struct NearestNeighborSubtractor {
    params: NearestNeighborParams,
    dimensions: (u32, u32),
    samples: Vec<[u8; 3]>,
    frames_seen: u64,
    rng: StdRng,
}

impl NearestNeighborSubtractor {
    pub fn new(params: NearestNeighborParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            dimensions: (0, 0),
            samples: Vec::new(),
            frames_seen: 0,
            rng,
        }
    }

    fn initialize(&mut self, frame: &Frame) {
        self.dimensions = frame.dimensions();
        let n = self.params.samples.max(1);
        self.samples = Vec::with_capacity(frame.image.pixels().len() * n);
        for pixel in frame.image.pixels() {
            for _ in 0..n {
                self.samples.push([pixel[0], pixel[1], pixel[2]]);
            }
        }
        self.frames_seen = 1;
    }

    fn replacement_probability(&self) -> f64 {
        let window = self.frames_seen.min(self.params.history).max(1);
        (self.params.samples as f64 / window as f64).min(1.0)
    }
}

impl BackgroundSubtractor for NearestNeighborSubtractor {
    fn apply(&mut self, frame: &Frame) -> VisionResult<ForegroundMask> {
        let (width, height) = frame.dimensions();
        if self.frames_seen == 0 || self.dimensions != (width, height) {
            self.initialize(frame);
            return Ok(ForegroundMask::empty(width, height));
        }

        self.frames_seen += 1;
        let n = self.params.samples.max(1);
        let probability = self.replacement_probability();
        let mut cells = GrayImage::new(width, height);

        for (i, (pixel, cell)) in frame.image.pixels().zip(cells.pixels_mut()).enumerate() {
            let bag = &mut self.samples[i * n..(i + 1) * n];
            let matches = bag
                .iter()
                .filter(|s| {
                    let dist2: f32 = (0..3)
                        .map(|c| (pixel[c] as f32 - s[c] as f32).powi(2))
                        .sum();
                    dist2 < self.params.dist2_threshold
                })
                .count();

            *cell = Luma([if matches >= self.params.required_matches {
                BACKGROUND
            } else {
                FOREGROUND
            }]);

            if self.rng.gen_bool(probability) {
                let slot = self.rng.gen_range(0..n);
                bag[slot] = [pixel[0], pixel[1], pixel[2]];
            }
        }

        Ok(ForegroundMask::new(cells))
    }
}
