// THEORY:
// The `localizer` module defines the common contract for turning a motion-gated
// frame into labeled bounding boxes. Two strategies implement it:
// - `NetworkLocalizer` (see `network_localizer`) delegates to a trained detection
//   network held in an injected `ModelContext`.
// - `ContourLocalizer` (see `contour_localizer`) derives regions straight from the
//   foreground mask's connected components, with no model at all.
//
// The choice is made once, when the pipeline is built, by handing it a
// `Box<dyn Localizer>`. No call site branches on the variant afterwards.

use crate::core_modules::frame::{ForegroundMask, Frame};
use image::RgbImage;
use std::str::FromStr;

use crate::error::VisionError;

/// The detection label that arms the clip recorder.
pub const PERSON_LABEL: &str = "person";

/// An axis-aligned box in source-frame pixel coordinates, anchored top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// One labeled object found in a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bounding_box: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bounding_box,
        }
    }

    pub fn is_person(&self) -> bool {
        self.label == PERSON_LABEL
    }
}

/// Output of a localizer for one frame.
#[derive(Debug, Clone)]
pub struct Localization {
    /// A copy of the input frame with boxes drawn on it.
    pub annotated: RgbImage,
    pub detections: Vec<Detection>,
    /// A cleaned-up mask, when the strategy derives one. The tracker prefers it
    /// over the raw operator mask.
    pub refined_mask: Option<ForegroundMask>,
}

/// The localization strategy interface.
pub trait Localizer {
    /// Finds objects in `frame`. `mask` is the operator's foreground mask for the
    /// same frame; strategies that do not need it ignore it.
    fn localize(&mut self, frame: &Frame, mask: &ForegroundMask) -> Localization;
}

/// Which localization strategy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalizerKind {
    Network,
    Contour,
}

impl FromStr for LocalizerKind {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "network" | "darknet" | "yolo" => Ok(Self::Network),
            "contour" | "contours" => Ok(Self::Contour),
            other => Err(VisionError::InvalidConfig(format!(
                "unknown localizer '{other}' (expected network or contour)"
            ))),
        }
    }
}
