// THEORY:
// The `features` module selects the "good features to track" that the trajectory
// tracker follows: corners, as scored by the Shi-Tomasi criterion.
//
// Algorithm steps:
// 1.  **Gradients**: Sobel derivatives of the grayscale frame.
// 2.  **Structure Tensor**: For every pixel, the sums of Ix², Iy² and IxIy over a
//     `block_size` window, read in O(1) from integral images.
// 3.  **Response**: The smaller eigenvalue of that 2x2 tensor. It is only large
//     where the image varies strongly in two directions, i.e. at a corner.
// 4.  **Selection**: Responses outside the mask are discarded, weak ones (below
//     `quality_level` times the strongest) are cut, 3x3 non-maxima are dropped,
//     and the rest are taken strongest first while keeping `min_distance`
//     between accepted points, up to `max_corners`.
//
// An image with no texture, or a mask with no foreground, produces an empty list.
// That is a normal outcome, not an error.

use crate::core_modules::frame::ForegroundMask;
use image::GrayImage;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

#[derive(Debug, Clone)]
pub struct FeatureParams {
    pub max_corners: usize,
    /// Fraction of the best corner's response a corner must reach.
    pub quality_level: f32,
    /// Minimum Euclidean spacing between returned corners, in pixels.
    pub min_distance: f32,
    /// Side of the window the structure tensor is summed over.
    pub block_size: u32,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            max_corners: 100,
            quality_level: 0.3,
            min_distance: 7.0,
            block_size: 7,
        }
    }
}

/// Summed-area table with a zero first row and column.
struct Integral {
    stride: usize,
    sums: Vec<f64>,
}

impl Integral {
    fn new(width: usize, height: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let stride = width + 1;
        let mut sums = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0.0;
            for x in 0..width {
                row += value(x, y);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { stride, sums }
    }

    /// Sum over the inclusive rectangle [x0, x1] x [y0, y1].
    fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let s = self.stride;
        self.sums[(y1 + 1) * s + x1 + 1] - self.sums[y0 * s + x1 + 1] - self.sums[(y1 + 1) * s + x0]
            + self.sums[y0 * s + x0]
    }
}

/// Shi-Tomasi corner selection, optionally restricted to a foreground mask.
pub fn good_features_to_track(
    gray: &GrayImage,
    mask: Option<&ForegroundMask>,
    params: &FeatureParams,
) -> Vec<(f32, f32)> {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 || params.max_corners == 0 {
        return Vec::new();
    }
    if let Some(mask) = mask {
        if mask.dimensions() != (width, height) {
            return Vec::new();
        }
    }

    let (w, h) = (width as usize, height as usize);
    let gx = horizontal_sobel(gray);
    let gy = vertical_sobel(gray);
    let grad = |x: usize, y: usize| {
        (
            gx.get_pixel(x as u32, y as u32)[0] as f64,
            gy.get_pixel(x as u32, y as u32)[0] as f64,
        )
    };
    let ixx = Integral::new(w, h, |x, y| grad(x, y).0.powi(2));
    let iyy = Integral::new(w, h, |x, y| grad(x, y).1.powi(2));
    let ixy = Integral::new(w, h, |x, y| {
        let (dx, dy) = grad(x, y);
        dx * dy
    });

    let half = (params.block_size.max(1) / 2) as usize;
    let mut response = vec![0.0f32; w * h];
    let mut best = 0.0f32;
    for y in 0..h {
        for x in 0..w {
            if let Some(mask) = mask {
                if !mask.is_set(x as u32, y as u32) {
                    continue;
                }
            }
            let (x0, y0) = (x.saturating_sub(half), y.saturating_sub(half));
            let (x1, y1) = ((x + half).min(w - 1), (y + half).min(h - 1));
            let a = ixx.sum(x0, y0, x1, y1);
            let c = iyy.sum(x0, y0, x1, y1);
            let b = ixy.sum(x0, y0, x1, y1);
            let min_eigen = (a + c) / 2.0 - (((a - c) / 2.0).powi(2) + b * b).sqrt();
            let value = min_eigen.max(0.0) as f32;
            response[y * w + x] = value;
            best = best.max(value);
        }
    }
    if best <= 0.0 {
        return Vec::new();
    }

    let threshold = best * params.quality_level;
    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let value = response[y * w + x];
            if value <= 0.0 || value < threshold {
                continue;
            }
            let is_peak = (y - 1..=y + 1)
                .all(|ny| (x - 1..=x + 1).all(|nx| response[ny * w + nx] <= value));
            if is_peak {
                candidates.push((value, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.2.cmp(&b.2)).then(a.1.cmp(&b.1)));

    let min_dist2 = params.min_distance * params.min_distance;
    let mut corners: Vec<(f32, f32)> = Vec::with_capacity(params.max_corners);
    for (_, x, y) in candidates {
        let point = (x as f32, y as f32);
        let spaced = corners
            .iter()
            .all(|c| (c.0 - point.0).powi(2) + (c.1 - point.1).powi(2) >= min_dist2);
        if spaced {
            corners.push(point);
            if corners.len() == params.max_corners {
                break;
            }
        }
    }
    corners
}
