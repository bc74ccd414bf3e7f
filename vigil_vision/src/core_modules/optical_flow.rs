// THEORY:
// The `optical_flow` module estimates where a sparse set of points moved between
// two grayscale images: pyramidal Lucas-Kanade.
//
// Key architectural principles:
// 1.  **Coarse to Fine**: Both images are repeatedly halved into a pyramid. A
//     point's displacement is first solved on the smallest level, where large
//     motions become small, and the estimate is doubled and refined on each finer
//     level.
// 2.  **Local Least Squares**: On each level the displacement inside a square
//     window is the solution of a 2x2 system built from the previous image's
//     spatial gradients (the structure tensor) and the temporal difference. The
//     system is re-solved a bounded number of times, stopping early once an
//     update is smaller than `epsilon`.
// 3.  **Status, not Errors**: A point whose window has no texture (singular
//     tensor) or that drifts out of the image is reported with `found == false`.
//     The caller filters; nothing here fails.

use image::GrayImage;
use image::imageops::FilterType;

#[derive(Debug, Clone)]
pub struct FlowParams {
    /// Side of the square search window, in pixels.
    pub window: u32,
    /// Number of pyramid levels above the full-resolution image.
    pub max_level: u32,
    pub max_iterations: u32,
    /// Convergence bound on the per-iteration update, in pixels.
    pub epsilon: f32,
    /// Windows whose normalized smallest eigenvalue is below this are untrackable.
    pub min_eigen_threshold: f32,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            window: 15,
            max_level: 2,
            max_iterations: 10,
            epsilon: 0.03,
            min_eigen_threshold: 1e-4,
        }
    }
}

/// Tracking result for one input point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowPoint {
    pub position: (f32, f32),
    pub found: bool,
}

/// A single-channel image with intensities scaled to [0, 1].
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    fn at(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    /// Bilinear sample with clamp-to-edge.
    fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let (fx, fy) = (x - x0, y - y0);
        let (ix, iy) = (x0 as isize, y0 as isize);
        let top = self.at(ix, iy) * (1.0 - fx) + self.at(ix + 1, iy) * fx;
        let bottom = self.at(ix, iy + 1) * (1.0 - fx) + self.at(ix + 1, iy + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn gradient(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (self.sample(x + 1.0, y) - self.sample(x - 1.0, y)) / 2.0,
            (self.sample(x, y + 1.0) - self.sample(x, y - 1.0)) / 2.0,
        )
    }
}

fn pyramid(gray: &GrayImage, levels: u32, window: u32) -> Vec<Plane> {
    let mut planes = vec![Plane::from_gray(gray)];
    let mut current = gray.clone();
    for _ in 0..levels {
        let (w, h) = (current.width() / 2, current.height() / 2);
        if w < window || h < window {
            break;
        }
        current = image::imageops::resize(&current, w, h, FilterType::Triangle);
        planes.push(Plane::from_gray(&current));
    }
    planes
}

/// Tracks `points` from `prev` into `next`.
///
/// The output has one entry per input point, in the same order.
pub fn calc_optical_flow_pyr_lk(
    prev: &GrayImage,
    next: &GrayImage,
    points: &[(f32, f32)],
    params: &FlowParams,
) -> Vec<FlowPoint> {
    if points.is_empty() {
        return Vec::new();
    }
    let lost = |p: &(f32, f32)| FlowPoint { position: *p, found: false };
    if prev.dimensions() != next.dimensions() || prev.width() == 0 || prev.height() == 0 {
        return points.iter().map(lost).collect();
    }

    let prev_pyr = pyramid(prev, params.max_level, params.window);
    let next_pyr = pyramid(next, params.max_level, params.window);
    let levels = prev_pyr.len().min(next_pyr.len());

    points
        .iter()
        .map(|point| track_point(&prev_pyr[..levels], &next_pyr[..levels], *point, params))
        .collect()
}

fn track_point(prev: &[Plane], next: &[Plane], point: (f32, f32), params: &FlowParams) -> FlowPoint {
    let half = (params.window.max(3) / 2) as i32;
    let area = ((2 * half + 1) * (2 * half + 1)) as f32;
    let mut guess = (0.0f32, 0.0f32);

    for level in (0..prev.len()).rev() {
        let scale = (1u32 << level) as f32;
        let (px, py) = (point.0 / scale, point.1 / scale);
        let (i_plane, j_plane) = (&prev[level], &next[level]);

        // structure tensor of the previous image around the point
        let mut window = Vec::with_capacity(area as usize);
        let (mut gxx, mut gxy, mut gyy) = (0.0f32, 0.0f32, 0.0f32);
        for dy in -half..=half {
            for dx in -half..=half {
                let (x, y) = (px + dx as f32, py + dy as f32);
                let (ix, iy) = i_plane.gradient(x, y);
                gxx += ix * ix;
                gxy += ix * iy;
                gyy += iy * iy;
                window.push((dx as f32, dy as f32, i_plane.sample(x, y), ix, iy));
            }
        }
        let det = gxx * gyy - gxy * gxy;
        let min_eigen = ((gxx + gyy) - ((gxx - gyy).powi(2) + 4.0 * gxy * gxy).sqrt()) / 2.0;
        if min_eigen / area < params.min_eigen_threshold || det.abs() < f32::EPSILON {
            return FlowPoint { position: point, found: false };
        }

        let mut flow = (0.0f32, 0.0f32);
        for _ in 0..params.max_iterations {
            let (mut bx, mut by) = (0.0f32, 0.0f32);
            for &(dx, dy, intensity, ix, iy) in &window {
                let moved = j_plane.sample(px + guess.0 + flow.0 + dx, py + guess.1 + flow.1 + dy);
                let diff = intensity - moved;
                bx += diff * ix;
                by += diff * iy;
            }
            let eta = ((gyy * bx - gxy * by) / det, (gxx * by - gxy * bx) / det);
            flow = (flow.0 + eta.0, flow.1 + eta.1);
            if eta.0 * eta.0 + eta.1 * eta.1 < params.epsilon * params.epsilon {
                break;
            }
        }

        guess = if level > 0 {
            (2.0 * (guess.0 + flow.0), 2.0 * (guess.1 + flow.1))
        } else {
            (guess.0 + flow.0, guess.1 + flow.1)
        };
    }

    let position = (point.0 + guess.0, point.1 + guess.1);
    let (w, h) = (prev[0].width as f32, prev[0].height as f32);
    let inside = position.0 >= 0.0 && position.1 >= 0.0 && position.0 <= w - 1.0 && position.1 <= h - 1.0;
    let finite = position.0.is_finite() && position.1.is_finite();
    FlowPoint {
        position,
        found: inside && finite,
    }
}
