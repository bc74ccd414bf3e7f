// THEORY:
// The `tracker` module visualizes short-term point motion inside the motion-gated
// frames and accumulates the resulting trails on a persistent overlay.
//
// Key architectural principles:
// 1.  **Per-frame Re-seeding**: Points are not persistent objects. On every gated
//     frame a fresh set of corners is selected inside the foreground and tracked
//     with sparse optical flow. There is no identity carried between calls; the
//     colors come from the point's rank in the surviving set, recycled over a
//     fixed palette.
// 2.  **Trail Source**: `TrailMode::SameFrame` computes the flow between two
//     grayscale copies of the current frame, so each trail is a dot marking where
//     a corner was seen. `TrailMode::ConsecutiveGated` instead selects corners on
//     the previous gated frame and follows them into the current one, drawing
//     real motion segments.
// 3.  **Cumulative Record**: The `TrackOverlay` is created once and only ever
//     receives strokes. It is never cleared, so the composite shows every place
//     motion was tracked since startup.
// 4.  **Empty is Normal**: No corners (no texture, no foreground) means no flow
//     is computed and the frame passes through untouched.
// 5.  **Swappable Operator**: Corner selection and flow sit behind the
//     `FlowOperator` trait, like background subtraction does. `NativeFlow` is the
//     pure-Rust default; the runner swaps in OpenCV's when built with it.

use crate::core_modules::canvas::draw_thick_line;
use crate::core_modules::features::{FeatureParams, good_features_to_track};
use crate::core_modules::frame::{ForegroundMask, Frame};
use crate::core_modules::optical_flow::{FlowParams, FlowPoint, calc_optical_flow_pyr_lk};
use crate::error::{VisionError, VisionResult};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

pub const PALETTE_SIZE: usize = 100;
const TRAIL_THICKNESS: u32 = 2;
const MARKER_RADIUS: i32 = 5;

/// A fixed table of random colors, indexed by a point's rank.
#[derive(Debug, Clone)]
pub struct Palette {
    colors: Vec<Rgb<u8>>,
}

impl Palette {
    pub fn random() -> Self {
        Self::from_rng(&mut rand::thread_rng())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(&mut StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: &mut impl Rng) -> Self {
        let colors = (0..PALETTE_SIZE)
            .map(|_| Rgb([rng.gen_range(0..255), rng.gen_range(0..255), rng.gen_range(0..255)]))
            .collect();
        Self { colors }
    }

    pub fn color(&self, color_id: usize) -> Rgb<u8> {
        self.colors[color_id % self.colors.len()]
    }
}

/// Where the "previous" image of the optical flow comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailMode {
    /// Previous and current are the same frame.
    #[default]
    SameFrame,
    /// Previous is the last motion-gated frame.
    ConsecutiveGated,
}

impl FromStr for TrailMode {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "same-frame" | "same_frame" | "same" => Ok(Self::SameFrame),
            "consecutive" | "consecutive-gated" | "consecutive_gated" => Ok(Self::ConsecutiveGated),
            other => Err(VisionError::InvalidConfig(format!(
                "unknown trail mode '{other}' (expected same-frame or consecutive)"
            ))),
        }
    }
}

/// The external contract for corner selection and sparse optical flow.
pub trait FlowOperator {
    /// Picks trackable corners of `gray`, only where `mask` is set.
    fn select_corners(&mut self, gray: &GrayImage, mask: &ForegroundMask) -> VisionResult<Vec<(f32, f32)>>;

    /// Follows `points` from `previous` into `next`. One result per input point,
    /// in input order.
    fn track(
        &mut self,
        previous: &GrayImage,
        next: &GrayImage,
        points: &[(f32, f32)],
    ) -> VisionResult<Vec<FlowPoint>>;
}

/// Shi-Tomasi corners and pyramidal Lucas-Kanade, in pure Rust.
#[derive(Debug, Clone, Default)]
pub struct NativeFlow {
    pub features: FeatureParams,
    pub flow: FlowParams,
}

impl FlowOperator for NativeFlow {
    fn select_corners(&mut self, gray: &GrayImage, mask: &ForegroundMask) -> VisionResult<Vec<(f32, f32)>> {
        Ok(good_features_to_track(gray, Some(mask), &self.features))
    }

    fn track(
        &mut self,
        previous: &GrayImage,
        next: &GrayImage,
        points: &[(f32, f32)],
    ) -> VisionResult<Vec<FlowPoint>> {
        Ok(calc_optical_flow_pyr_lk(previous, next, points, &self.flow))
    }
}

/// A tracked point of the current call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    /// Position in source-frame pixels.
    pub position: (f32, f32),
    /// Index into the palette.
    pub color_id: usize,
}

/// Accumulating stroke buffer with the dimensions of the padded display frame.
pub struct TrackOverlay {
    image: RgbImage,
    /// Offset between frame coordinates and overlay coordinates.
    border: u32,
}

impl TrackOverlay {
    /// Creates a blank overlay for frames of `width` x `height` padded by `border`.
    pub fn new(width: u32, height: u32, border: u32) -> Self {
        Self {
            image: RgbImage::new(width + 2 * border, height + 2 * border),
            border,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Consumes the overlay at shutdown, handing back the final trail picture.
    pub fn finish(self) -> RgbImage {
        self.image
    }

    fn stroke(&mut self, from: (f32, f32), to: (f32, f32), color: Rgb<u8>) {
        let b = self.border as f32;
        draw_thick_line(
            &mut self.image,
            (from.0 + b, from.1 + b),
            (to.0 + b, to.1 + b),
            color,
            TRAIL_THICKNESS,
        );
    }
}

/// Result of one tracker call.
#[derive(Debug, Clone)]
pub struct TrackUpdate {
    /// The input canvas with a marker on every surviving point.
    pub annotated: RgbImage,
    pub points: Vec<TrackPoint>,
}

pub struct TrajectoryTracker {
    operator: Box<dyn FlowOperator>,
    palette: Palette,
    mode: TrailMode,
    /// Last gated frame's grayscale and mask, kept only in `ConsecutiveGated` mode.
    previous: Option<(GrayImage, ForegroundMask)>,
}

impl TrajectoryTracker {
    pub fn new(mode: TrailMode, palette: Palette) -> Self {
        Self {
            operator: Box::new(NativeFlow::default()),
            palette,
            mode,
            previous: None,
        }
    }

    pub fn with_operator(mut self, operator: Box<dyn FlowOperator>) -> Self {
        self.operator = operator;
        self
    }

    pub fn mode(&self) -> TrailMode {
        self.mode
    }

    /// Selects corners, tracks them, strokes the overlay and marks `canvas`.
    ///
    /// `canvas` is the image markers are drawn on (normally the localizer's
    /// annotated frame); it must have the frame's dimensions.
    pub fn update(
        &mut self,
        frame: &Frame,
        mask: &ForegroundMask,
        canvas: &RgbImage,
        overlay: &mut TrackOverlay,
    ) -> VisionResult<TrackUpdate> {
        let gray = frame.to_gray();

        let (seed_gray, seed_mask) = match (&self.mode, &self.previous) {
            (TrailMode::ConsecutiveGated, Some((prev_gray, prev_mask)))
                if prev_gray.dimensions() == gray.dimensions() =>
            {
                (prev_gray.clone(), prev_mask.clone())
            }
            _ => (gray.clone(), mask.clone()),
        };

        let seeds = self.operator.select_corners(&seed_gray, &seed_mask)?;
        if self.mode == TrailMode::ConsecutiveGated {
            self.previous = Some((gray.clone(), mask.clone()));
        }

        let mut annotated = canvas.clone();
        if seeds.is_empty() {
            return Ok(TrackUpdate {
                annotated,
                points: Vec::new(),
            });
        }

        let tracked = self.operator.track(&seed_gray, &gray, &seeds)?;
        let mut points = Vec::with_capacity(tracked.len());
        for (i, (old, new)) in seeds
            .iter()
            .zip(tracked.iter())
            .filter(|(_, t)| t.found)
            .map(|(old, t)| (*old, t.position))
            .enumerate()
        {
            let color_id = i % PALETTE_SIZE;
            let color = self.palette.color(color_id);
            overlay.stroke(new, old, color);
            draw_filled_circle_mut(
                &mut annotated,
                (new.0 as i32, new.1 as i32),
                MARKER_RADIUS,
                color,
            );
            points.push(TrackPoint {
                position: new,
                color_id,
            });
        }

        Ok(TrackUpdate { annotated, points })
    }
}
