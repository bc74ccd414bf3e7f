// THEORY:
// The `source` module is the acquisition seam. The pipeline only ever asks a
// `FrameSource` for "the next frame, if any"; whether that comes from a camera, a
// video file or a folder of stills is decided when the source is built.
//
// End of stream is `Ok(None)`, a normal termination. A frame that exists but
// cannot be read is an error and ends the run.

use crate::error::{VisionError, VisionResult};
use image::RgbImage;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::{Chars, FromStr};
use tracing::debug;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

pub trait FrameSource {
    /// Prepares the source. Failure here is fatal to the run.
    fn open(&mut self) -> VisionResult<()>;

    /// The next frame in RGB order, or `None` at end of stream.
    fn read_next_frame(&mut self) -> VisionResult<Option<RgbImage>>;

    /// Releases the underlying device or files. Safe to call more than once.
    fn release(&mut self);
}

/// Where frames come from: an integer is a capture device index, anything else
/// a path or stream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Device(i32),
    Path(PathBuf),
}

impl FromStr for SourceSpec {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VisionError::InvalidConfig("empty source".into()));
        }
        Ok(match s.parse::<i32>() {
            Ok(index) => Self::Device(index),
            Err(_) => Self::Path(PathBuf::from(s)),
        })
    }
}

/// Plays back the image files of a directory in file-name order, with numbers
/// inside names compared by value.
pub struct ImageSequenceSource {
    directory: PathBuf,
    pending: VecDeque<PathBuf>,
    opened: bool,
}

impl ImageSequenceSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            pending: VecDeque::new(),
            opened: false,
        }
    }

    fn is_image(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl FrameSource for ImageSequenceSource {
    fn open(&mut self) -> VisionResult<()> {
        let entries = std::fs::read_dir(&self.directory).map_err(|e| {
            VisionError::SourceOpen(format!("{}: {e}", self.directory.display()))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && Self::is_image(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(VisionError::SourceOpen(format!(
                "{}: no image files",
                self.directory.display()
            )));
        }
        files.sort_by(|a, b| natural_order(a, b));
        debug!(directory = %self.directory.display(), frames = files.len(), "Opened image sequence");

        self.pending = files.into();
        self.opened = true;
        Ok(())
    }

    fn read_next_frame(&mut self) -> VisionResult<Option<RgbImage>> {
        if !self.opened {
            return Err(VisionError::SourceRead("source is not open".into()));
        }
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let decoded = image::open(&path)
            .map_err(|e| VisionError::SourceRead(format!("{}: {e}", path.display())))?;
        Ok(Some(decoded.to_rgb8()))
    }

    fn release(&mut self) {
        self.pending.clear();
        self.opened = false;
    }
}

/// Orders paths so that digit runs compare by value: `frame2` before `frame10`.
fn natural_order(a: &Path, b: &Path) -> Ordering {
    let (a, b) = (a.to_string_lossy(), b.to_string_lossy());
    let (mut a, mut b) = (a.chars().peekable(), b.chars().peekable());
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let left = take_digits(&mut a);
                let right = take_digits(&mut b);
                let order = left
                    .trim_start_matches('0')
                    .len()
                    .cmp(&right.trim_start_matches('0').len())
                    .then_with(|| left.trim_start_matches('0').cmp(right.trim_start_matches('0')))
                    .then_with(|| left.len().cmp(&right.len()));
                if order != Ordering::Equal {
                    return order;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        digits.push(c);
    }
    digits
}

/// Frames held in memory. Used for tests and for callers that decode elsewhere.
pub struct MemorySource {
    frames: VecDeque<RgbImage>,
    released: bool,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = RgbImage>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            released: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl FrameSource for MemorySource {
    fn open(&mut self) -> VisionResult<()> {
        self.released = false;
        Ok(())
    }

    fn read_next_frame(&mut self) -> VisionResult<Option<RgbImage>> {
        Ok(self.frames.pop_front())
    }

    fn release(&mut self) {
        self.released = true;
    }
}
