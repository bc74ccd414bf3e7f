// THEORY:
// The `clip_writer` module is the storage seam of the recorder. The recorder
// decides *when* a clip is complete and *where* it goes; a `ClipWriter` only
// knows how to encode a finished sequence of frames into one file.
//
// The default writer encodes an animated GIF with the `image` crate so the
// library works without any native video stack. The runner's `opencv` feature
// provides an AVI writer behind the same trait.

use crate::error::{VisionError, VisionResult};
use chrono::NaiveDateTime;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, RgbImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Encodes a finished clip to durable storage.
pub trait ClipWriter {
    /// File extension (without the dot) of the clips this writer produces.
    fn extension(&self) -> &str;

    /// Writes `frames` as one clip of `width` x `height` to `destination`.
    /// The parent directory already exists.
    fn write(&mut self, frames: &[RgbImage], width: u32, height: u32, destination: &Path) -> VisionResult<()>;
}

/// `<root>/<YYYY-MM-DD>/<HH-MM-SS>.<ext>` for a clip flushed at `at`.
pub fn clip_destination(root: &Path, at: NaiveDateTime, extension: &str) -> PathBuf {
    root.join(at.format("%Y-%m-%d").to_string())
        .join(format!("{}.{}", at.format("%H-%M-%S"), extension))
}

/// `destination` itself when nothing is there yet, otherwise the first free
/// `<stem>-<n>.<ext>` next to it.
pub fn unused_destination(destination: PathBuf) -> PathBuf {
    if !destination.exists() {
        return destination;
    }
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = destination
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = destination.with_file_name(format!("{stem}-{n}{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Animated GIF clips.
pub struct GifClipWriter {
    fps: u32,
    /// 1 (best quality, slowest) to 30 (fastest).
    speed: i32,
}

impl GifClipWriter {
    pub fn new(fps: u32) -> Self {
        Self { fps: fps.max(1), speed: 10 }
    }
}

impl ClipWriter for GifClipWriter {
    fn extension(&self) -> &str {
        "gif"
    }

    fn write(&mut self, frames: &[RgbImage], width: u32, height: u32, destination: &Path) -> VisionResult<()> {
        if frames.is_empty() {
            return Err(VisionError::clip_write(destination, "no frames to write"));
        }

        let output = BufWriter::new(File::create(destination)?);
        let mut encoder = GifEncoder::new_with_speed(output, self.speed);
        encoder.set_repeat(Repeat::Infinite)?;

        let delay = Delay::from_numer_denom_ms(1000, self.fps);
        for frame in frames {
            let rgba = if frame.dimensions() == (width, height) {
                DynamicImage::ImageRgb8(frame.clone()).to_rgba8()
            } else {
                // clips take the first frame's size
                DynamicImage::ImageRgb8(frame.clone())
                    .resize_exact(width, height, image::imageops::FilterType::Triangle)
                    .to_rgba8()
            };
            encoder.encode_frame(image::Frame::from_parts(rgba, 0, 0, delay))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use image::{AnimationDecoder, Rgb};
    use image::codecs::gif::GifDecoder;
    use std::io::BufReader;

    #[test]
    fn destination_follows_date_and_time_convention() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 2)
            .unwrap();
        let path = clip_destination(Path::new("detections"), at, "avi");
        assert_eq!(path, PathBuf::from("detections/2024-03-07/09-05-02.avi"));
    }

    #[test]
    fn taken_destination_gets_a_numbered_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("09-05-02.gif");
        assert_eq!(unused_destination(first.clone()), first);

        std::fs::write(&first, b"clip").unwrap();
        let second = unused_destination(first.clone());
        assert_eq!(second, dir.path().join("09-05-02-1.gif"));

        std::fs::write(&second, b"clip").unwrap();
        assert_eq!(unused_destination(first), dir.path().join("09-05-02-2.gif"));
    }

    #[test]
    fn writes_every_frame_of_a_gif() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("clip.gif");
        let frames: Vec<RgbImage> = (0..5)
            .map(|i| RgbImage::from_pixel(12, 8, Rgb([i * 40, 0, 0])))
            .collect();

        GifClipWriter::new(20).write(&frames, 12, 8, &destination).unwrap();

        let decoder = GifDecoder::new(BufReader::new(File::open(&destination).unwrap())).unwrap();
        let decoded = decoder.into_frames().collect_frames().unwrap();
        assert_eq!(decoded.len(), 5);
        assert_eq!(decoded[0].buffer().dimensions(), (12, 8));
    }

    #[test]
    fn empty_clip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = GifClipWriter::new(20).write(&[], 4, 4, &dir.path().join("x.gif"));
        assert!(matches!(result, Err(VisionError::ClipWrite { .. })));
    }
}
