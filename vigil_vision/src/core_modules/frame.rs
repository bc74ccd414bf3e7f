// THEORY:
// The `frame` module holds the two "dumb" data containers that flow through the
// whole pipeline: the `Frame` captured from the source and the `ForegroundMask`
// derived from it by the background operator.
//
// Key architectural principles:
// 1.  **Immutability**: Downstream stages never draw on a `Frame` in place. They
//     clone the image they want to annotate and hand back a new buffer. The
//     orchestrator owns the frame for exactly one iteration.
// 2.  **Shape Agreement**: A mask always has the spatial dimensions of the frame
//     it was derived from. Padding (the colored border) is applied later, only to
//     display buffers.
// 3.  **Cheap Statistics**: The mask knows how to count its own foreground cells;
//     that count ("occupancy") is the coarse motion proxy every gate decision is
//     made from.

use image::{GrayImage, Luma, RgbImage};

/// Value written by the background operators for a foreground cell.
pub const FOREGROUND: u8 = 255;
/// Value written for a cell judged to be a cast shadow. Non-zero, so it counts
/// towards occupancy.
pub const SHADOW: u8 = 127;
/// Value for a background cell.
pub const BACKGROUND: u8 = 0;

/// A single captured image plus its position in the stream.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing sequence number assigned by the orchestrator.
    pub index: u64,
    /// Pixel data in RGB channel order.
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Luma conversion used by the corner detector and the optical flow.
    pub fn to_gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }
}

/// Per-pixel foreground indicator produced by a background operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ForegroundMask {
    cells: GrayImage,
}

impl ForegroundMask {
    pub fn new(cells: GrayImage) -> Self {
        Self { cells }
    }

    /// An all-background mask of the given size.
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            cells: GrayImage::from_pixel(width, height, Luma([BACKGROUND])),
        }
    }

    pub fn width(&self) -> u32 {
        self.cells.width()
    }

    pub fn height(&self) -> u32 {
        self.cells.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.cells.dimensions()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.as_raw().is_empty()
    }

    /// Number of cells that indicate any change (foreground or shadow).
    pub fn occupancy(&self) -> usize {
        self.cells.as_raw().iter().filter(|&&v| v != BACKGROUND).count()
    }

    /// Whether the cell at (x, y) is non-zero. Out-of-bounds reads are background.
    pub fn is_set(&self, x: u32, y: u32) -> bool {
        x < self.width() && y < self.height() && self.cells.get_pixel(x, y)[0] != BACKGROUND
    }

    pub fn as_gray(&self) -> &GrayImage {
        &self.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupancy_counts_shadow_and_foreground() {
        let mut cells = GrayImage::new(4, 4);
        cells.put_pixel(0, 0, Luma([FOREGROUND]));
        cells.put_pixel(1, 0, Luma([SHADOW]));
        cells.put_pixel(2, 3, Luma([1]));
        let mask = ForegroundMask::new(cells);

        assert_eq!(mask.occupancy(), 3);
        assert!(mask.is_set(1, 0));
        assert!(!mask.is_set(3, 3));
        assert!(!mask.is_set(10, 10));
    }

    #[test]
    fn empty_mask_has_no_occupancy() {
        let mask = ForegroundMask::empty(8, 6);
        assert_eq!(mask.dimensions(), (8, 6));
        assert_eq!(mask.occupancy(), 0);
        assert!(ForegroundMask::empty(0, 0).is_empty());
    }
}
