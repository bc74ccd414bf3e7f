//! Drawing helpers shared by the localizers, the tracker and the compositor.

use crate::core_modules::localizer::BoundingBox;
use crate::error::{VisionError, VisionResult};
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

const LABEL_SCALE: f32 = 16.0;

/// A TrueType font used for detection labels.
pub struct LabelFont {
    font: FontVec,
}

impl LabelFont {
    pub fn load(path: &Path) -> VisionResult<Self> {
        let bytes = std::fs::read(path)?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| {
            VisionError::InvalidConfig(format!("invalid font {}: {e}", path.display()))
        })?;
        Ok(Self { font })
    }
}

/// Surrounds `image` with a constant-colored border of `width` pixels.
pub fn pad_with_border(image: &RgbImage, width: u32, color: Rgb<u8>) -> RgbImage {
    let mut padded = RgbImage::from_pixel(
        image.width() + 2 * width,
        image.height() + 2 * width,
        color,
    );
    image::imageops::replace(&mut padded, image, width as i64, width as i64);
    padded
}

/// Per-channel saturating sum of two equally sized images.
pub fn saturating_add(base: &RgbImage, overlay: &RgbImage) -> RgbImage {
    debug_assert_eq!(base.dimensions(), overlay.dimensions());
    let mut out = base.clone();
    for (dst, src) in out.pixels_mut().zip(overlay.pixels()) {
        for c in 0..3 {
            dst[c] = dst[c].saturating_add(src[c]);
        }
    }
    out
}

/// Draws a line segment `thickness` pixels wide.
pub fn draw_thick_line(
    image: &mut RgbImage,
    from: (f32, f32),
    to: (f32, f32),
    color: Rgb<u8>,
    thickness: u32,
) {
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    // offset perpendicular to the dominant direction
    let (ox, oy) = if dx.abs() >= dy.abs() { (0.0, 1.0) } else { (1.0, 0.0) };
    for step in 0..thickness.max(1) {
        let shift = step as f32 - (thickness.max(1) - 1) as f32 / 2.0;
        draw_line_segment_mut(
            image,
            (from.0 + ox * shift, from.1 + oy * shift),
            (to.0 + ox * shift, to.1 + oy * shift),
            color,
        );
    }
}

/// Draws a detection rectangle, clipped to the image by imageproc.
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let rect = Rect::at(bbox.x, bbox.y).of_size(bbox.width.max(1), bbox.height.max(1));
    draw_hollow_rect_mut(image, rect, color);
}

/// Draws `text` on a filled tab just above `bbox`.
pub fn draw_label(image: &mut RgbImage, font: &LabelFont, bbox: &BoundingBox, text: &str, color: Rgb<u8>) {
    let scale = PxScale::from(LABEL_SCALE);
    let (w, h) = text_size(scale, &font.font, text);
    let y = (bbox.y - h as i32 - 2).max(0);
    let tab = Rect::at(bbox.x, y).of_size(w.max(1) + 2, h.max(1) + 2);
    draw_filled_rect_mut(image, tab, color);
    draw_text_mut(image, BLACK, bbox.x + 1, y + 1, scale, &font.font, text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_surrounds_the_image() {
        let image = RgbImage::from_pixel(4, 3, Rgb([7, 7, 7]));
        let padded = pad_with_border(&image, 10, GREEN);
        assert_eq!(padded.dimensions(), (24, 23));
        assert_eq!(*padded.get_pixel(0, 0), GREEN);
        assert_eq!(*padded.get_pixel(10, 10), Rgb([7, 7, 7]));
        assert_eq!(*padded.get_pixel(13, 12), Rgb([7, 7, 7]));
        assert_eq!(*padded.get_pixel(14, 12), GREEN);
    }

    #[test]
    fn composite_saturates() {
        let base = RgbImage::from_pixel(2, 2, Rgb([200, 10, 0]));
        let overlay = RgbImage::from_pixel(2, 2, Rgb([100, 10, 0]));
        let out = saturating_add(&base, &overlay);
        assert_eq!(*out.get_pixel(1, 1), Rgb([255, 20, 0]));
    }

    #[test]
    fn thick_line_is_wider_than_one_pixel() {
        let mut image = RgbImage::new(20, 20);
        draw_thick_line(&mut image, (2.0, 10.0), (17.0, 10.0), RED, 2);
        let rows = (0..20)
            .filter(|&y| *image.get_pixel(8, y) == RED)
            .count();
        assert_eq!(rows, 2);
    }

    #[test]
    fn boxes_are_clipped_to_the_image() {
        let mut image = RgbImage::new(10, 10);
        let bbox = BoundingBox { x: 5, y: 5, width: 20, height: 20 };
        draw_box(&mut image, &bbox, GREEN);
        assert_eq!(*image.get_pixel(5, 9), GREEN);
        assert_eq!(*image.get_pixel(9, 5), GREEN);
    }
}
