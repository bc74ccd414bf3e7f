// THEORY:
// The `ContourLocalizer` is the model-free localization strategy. It finds moving
// objects purely from the geometry of the foreground mask.
//
// Algorithm steps:
// 1.  **Denoising**: A morphological opening removes isolated speckles left by
//     sensor noise, so single-pixel flicker does not become a "region".
// 2.  **Grouping**: 8-connected component labelling groups the surviving
//     foreground cells into spatially coherent regions.
// 3.  **Data Aggregation**: For each region the bounding box and filled area are
//     accumulated in a single pass over the label image.
// 4.  **Filtering**: Regions smaller than `min_region_area` are dropped.
//
// It is a stateless utility: it has no memory of previous frames and it never
// fails. An empty mask simply yields zero regions.

use crate::core_modules::canvas::{GREEN, draw_box};
use crate::core_modules::frame::{ForegroundMask, Frame};
use crate::core_modules::localizer::{BoundingBox, Detection, Localization, Localizer};
use image::Luma;
use imageproc::distance_transform::Norm;
use imageproc::morphology::open;
use imageproc::region_labelling::{Connectivity, connected_components};

/// Label given to every region found from the mask.
pub const MOTION_LABEL: &str = "motion";

#[derive(Debug, Clone)]
pub struct ContourParams {
    /// Radius of the opening applied before labelling. Zero disables it.
    pub open_radius: u8,
    /// Regions with fewer foreground pixels are ignored.
    pub min_region_area: u32,
}

impl Default for ContourParams {
    fn default() -> Self {
        Self {
            open_radius: 1,
            min_region_area: 50,
        }
    }
}

pub struct ContourLocalizer {
    params: ContourParams,
}

#[derive(Clone, Copy)]
struct RegionStats {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
}

impl ContourLocalizer {
    pub fn new(params: ContourParams) -> Self {
        Self { params }
    }

    /// Denoises the mask and returns the regions found in it.
    pub fn find_regions(&self, mask: &ForegroundMask) -> (ForegroundMask, Vec<Detection>) {
        if mask.is_empty() {
            return (mask.clone(), Vec::new());
        }

        let cleaned = if self.params.open_radius > 0 {
            open(mask.as_gray(), Norm::LInf, self.params.open_radius)
        } else {
            mask.as_gray().clone()
        };

        let labels = connected_components(&cleaned, Connectivity::Eight, Luma([0u8]));

        let mut regions: Vec<Option<RegionStats>> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let id = label[0] as usize;
            if id == 0 {
                continue;
            }
            if regions.len() < id {
                regions.resize(id, None);
            }
            let entry = &mut regions[id - 1];
            match entry {
                Some(stats) => {
                    stats.min_x = stats.min_x.min(x);
                    stats.min_y = stats.min_y.min(y);
                    stats.max_x = stats.max_x.max(x);
                    stats.max_y = stats.max_y.max(y);
                    stats.area += 1;
                }
                None => {
                    *entry = Some(RegionStats {
                        min_x: x,
                        min_y: y,
                        max_x: x,
                        max_y: y,
                        area: 1,
                    });
                }
            }
        }

        let detections = regions
            .into_iter()
            .flatten()
            .filter(|stats| stats.area >= self.params.min_region_area)
            .map(|stats| {
                let bounding_box = BoundingBox {
                    x: stats.min_x as i32,
                    y: stats.min_y as i32,
                    width: stats.max_x - stats.min_x + 1,
                    height: stats.max_y - stats.min_y + 1,
                };
                let fill = stats.area as f32 / bounding_box.area() as f32;
                Detection::new(MOTION_LABEL, fill, bounding_box)
            })
            .collect();

        (ForegroundMask::new(cleaned), detections)
    }
}

impl Default for ContourLocalizer {
    fn default() -> Self {
        Self::new(ContourParams::default())
    }
}

impl Localizer for ContourLocalizer {
    fn localize(&mut self, frame: &Frame, mask: &ForegroundMask) -> Localization {
        let (refined, detections) = self.find_regions(mask);
        let mut annotated = frame.image.clone();
        for detection in &detections {
            draw_box(&mut annotated, &detection.bounding_box, GREEN);
        }
        Localization {
            annotated,
            detections,
            refined_mask: Some(refined),
        }
    }
}
