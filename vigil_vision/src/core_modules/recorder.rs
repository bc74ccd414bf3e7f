// THEORY:
// The `recorder` module turns the unbounded stream of motion-gated frames into
// discrete, bounded clips. It is a small state machine driven one frame at a time.
//
// Key architectural principles:
// 1.  **Arming is Sampled at Rest**: The recorder only looks at the detections
//     when no clip is in progress (`frame_counter == 0`). A person in such a
//     frame arms it, and that same frame becomes the first of the clip. Once
//     armed it stays armed until the clip is flushed, whatever later frames show.
// 2.  **The Bound is the Trigger**: Frames are appended while armed. The append
//     that brings the buffer to `clip_frames` flushes it. There is no other flush
//     trigger, so every clip has exactly `clip_frames` frames and the buffer can
//     never exceed that bound.
// 3.  **Flush Always Resets**: The buffer is cleared, the counter zeroed and the
//     armed flag dropped whether or not the write succeeded. A failing disk costs
//     the clip, never memory.
// 4.  **Named at Flush Time**: The destination is derived from the wall-clock
//     time handed to the flushing `push`, not from when recording started. A
//     second clip flushed within the same second gets a numbered sibling name
//     instead of overwriting the first.

use crate::core_modules::clip_writer::{ClipWriter, clip_destination, unused_destination};
use crate::core_modules::localizer::Detection;
use crate::error::{VisionError, VisionResult};
use chrono::NaiveDateTime;
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_CLIP_FRAMES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// No clip in progress; the next frame is checked for a person.
    Idle,
    /// A person was seen; the current frame is about to be buffered.
    Armed,
    /// Buffering frames toward `clip_frames`.
    Recording,
    /// The buffer is full and being written out.
    Flushing,
}

/// What a single `push` did.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    /// The frame was not buffered.
    Ignored,
    /// The frame was buffered; `count` is the buffer length afterwards.
    Buffered { count: usize },
    /// The frame completed a clip that was written to `path`.
    Flushed { path: PathBuf, frames: usize },
    /// The frame completed a clip but writing it failed. The frames are gone.
    FlushFailed { path: PathBuf, error: String },
}

pub struct ClipRecorder {
    output_root: PathBuf,
    clip_frames: usize,
    writer: Box<dyn ClipWriter>,
    state: RecorderState,
    armed: bool,
    frame_counter: usize,
    buffer: Vec<RgbImage>,
}

impl ClipRecorder {
    pub fn new(
        output_root: impl Into<PathBuf>,
        clip_frames: usize,
        writer: Box<dyn ClipWriter>,
    ) -> VisionResult<Self> {
        if clip_frames == 0 {
            return Err(VisionError::InvalidConfig("clip length must be at least one frame".into()));
        }
        Ok(Self {
            output_root: output_root.into(),
            clip_frames,
            writer,
            state: RecorderState::Idle,
            armed: false,
            frame_counter: 0,
            buffer: Vec::new(),
        })
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn frame_counter(&self) -> usize {
        self.frame_counter
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clip_frames(&self) -> usize {
        self.clip_frames
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Offers one gated, annotated frame to the recorder. `now` names the clip if
    /// this frame completes it.
    pub fn push(&mut self, annotated: &RgbImage, detections: &[Detection], now: NaiveDateTime) -> RecorderEvent {
        if self.frame_counter == 0 && detections.iter().any(Detection::is_person) {
            if !self.armed {
                info!("Person detected, arming clip recorder");
            }
            self.armed = true;
            self.state = RecorderState::Armed;
        }

        if !self.armed {
            return RecorderEvent::Ignored;
        }

        self.state = RecorderState::Recording;
        self.buffer.push(annotated.clone());
        self.frame_counter += 1;
        debug!(frame = self.frame_counter, "Recording detection (frame {})", self.frame_counter);

        if self.frame_counter < self.clip_frames {
            return RecorderEvent::Buffered { count: self.buffer.len() };
        }

        self.state = RecorderState::Flushing;
        let event = self.flush(now);
        self.buffer.clear();
        self.frame_counter = 0;
        self.armed = false;
        self.state = RecorderState::Idle;
        event
    }

    fn flush(&mut self, now: NaiveDateTime) -> RecorderEvent {
        let named = clip_destination(&self.output_root, now, self.writer.extension());
        let destination = unused_destination(named.clone());
        if destination != named {
            warn!(taken = %named.display(), path = %destination.display(), "Clip name already used, writing alongside");
        }
        let frames = self.buffer.len();

        match self.write_clip(&destination) {
            Ok(()) => {
                info!(path = %destination.display(), frames, "Clip written");
                RecorderEvent::Flushed { path: destination, frames }
            }
            Err(error) => {
                warn!(path = %destination.display(), %error, "Clip write failed, dropping buffered frames");
                RecorderEvent::FlushFailed {
                    path: destination,
                    error: error.to_string(),
                }
            }
        }
    }

    fn write_clip(&mut self, destination: &Path) -> VisionResult<()> {
        let Some(first) = self.buffer.first() else {
            return Err(VisionError::clip_write(destination, "no frames to write"));
        };
        let (width, height) = first.dimensions();
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VisionError::clip_write(destination, e.to_string()))?;
        }
        self.writer.write(&self.buffer, width, height, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::clip_writer::GifClipWriter;
    use crate::core_modules::localizer::BoundingBox;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Written {
        clips: Vec<(PathBuf, usize, u32, u32)>,
    }

    struct RecordingWriter {
        written: Arc<Mutex<Written>>,
        fail: bool,
    }

    impl ClipWriter for RecordingWriter {
        fn extension(&self) -> &str {
            "avi"
        }

        fn write(&mut self, frames: &[RgbImage], width: u32, height: u32, destination: &Path) -> VisionResult<()> {
            if self.fail {
                return Err(VisionError::clip_write(destination, "disk full"));
            }
            self.written
                .lock()
                .unwrap()
                .clips
                .push((destination.to_path_buf(), frames.len(), width, height));
            Ok(())
        }
    }

    fn recorder(root: &Path, clip_frames: usize, fail: bool) -> (ClipRecorder, Arc<Mutex<Written>>) {
        let written = Arc::new(Mutex::new(Written::default()));
        let writer = RecordingWriter { written: written.clone(), fail };
        (ClipRecorder::new(root, clip_frames, Box::new(writer)).unwrap(), written)
    }

    fn person() -> Vec<Detection> {
        vec![Detection::new("person", 0.9, BoundingBox { x: 1, y: 1, width: 4, height: 8 })]
    }

    fn car() -> Vec<Detection> {
        vec![Detection::new("car", 0.9, BoundingBox { x: 1, y: 1, width: 8, height: 4 })]
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn no_person_never_records() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, written) = recorder(dir.path(), 5, false);
        let frame = RgbImage::new(8, 6);
        for _ in 0..20 {
            assert_eq!(rec.push(&frame, &car(), at(1, 0, 0)), RecorderEvent::Ignored);
            assert_eq!(rec.push(&frame, &[], at(1, 0, 0)), RecorderEvent::Ignored);
        }
        assert_eq!(rec.frame_counter(), 0);
        assert_eq!(rec.state(), RecorderState::Idle);
        assert!(written.lock().unwrap().clips.is_empty());
    }

    #[test]
    fn person_arms_and_the_same_frame_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, _) = recorder(dir.path(), 5, false);
        let frame = RgbImage::new(8, 6);

        assert_eq!(rec.push(&frame, &person(), at(1, 0, 0)), RecorderEvent::Buffered { count: 1 });
        assert_eq!(rec.state(), RecorderState::Recording);
        assert!(rec.is_armed());

        // sticky: later frames are recorded without a person
        assert_eq!(rec.push(&frame, &[], at(1, 0, 0)), RecorderEvent::Buffered { count: 2 });
        assert_eq!(rec.frame_counter(), 2);
    }

    #[test]
    fn full_buffer_flushes_exactly_once_with_first_frame_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, written) = recorder(dir.path(), DEFAULT_CLIP_FRAMES, false);

        let mut events = Vec::new();
        for i in 0..DEFAULT_CLIP_FRAMES {
            let frame = if i == 0 { RgbImage::new(32, 24) } else { RgbImage::new(30, 20) };
            let detections = if i == 0 { person() } else { Vec::new() };
            events.push(rec.push(&frame, &detections, at(13, 4, 59)));
            assert!(rec.buffered_len() <= DEFAULT_CLIP_FRAMES);
        }

        let expected = dir.path().join("2024-05-01").join("13-04-59.avi");
        assert_eq!(
            events.last(),
            Some(&RecorderEvent::Flushed { path: expected.clone(), frames: DEFAULT_CLIP_FRAMES })
        );
        let flushes = events
            .iter()
            .filter(|e| matches!(e, RecorderEvent::Flushed { .. }))
            .count();
        assert_eq!(flushes, 1);

        let written = written.lock().unwrap();
        assert_eq!(written.clips, vec![(expected, DEFAULT_CLIP_FRAMES, 32, 24)]);
        assert_eq!(rec.buffered_len(), 0);
        assert_eq!(rec.frame_counter(), 0);
        assert!(!rec.is_armed());
        assert_eq!(rec.state(), RecorderState::Idle);
        assert!(dir.path().join("2024-05-01").is_dir());
    }

    #[test]
    fn arming_is_only_sampled_between_clips() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, written) = recorder(dir.path(), 3, false);
        let frame = RgbImage::new(4, 4);

        rec.push(&frame, &person(), at(0, 0, 1));
        rec.push(&frame, &person(), at(0, 0, 2));
        rec.push(&frame, &person(), at(0, 0, 3));
        assert_eq!(written.lock().unwrap().clips.len(), 1);

        // idle again; a frame without a person does not start a clip
        assert_eq!(rec.push(&frame, &[], at(0, 0, 4)), RecorderEvent::Ignored);
        assert_eq!(rec.push(&frame, &person(), at(0, 0, 5)), RecorderEvent::Buffered { count: 1 });
    }

    #[test]
    fn failed_flush_still_clears_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, _) = recorder(dir.path(), 2, true);
        let frame = RgbImage::new(4, 4);

        rec.push(&frame, &person(), at(2, 0, 0));
        let event = rec.push(&frame, &[], at(2, 0, 0));

        assert!(matches!(event, RecorderEvent::FlushFailed { ref error, .. } if error.contains("disk full")));
        assert_eq!(rec.buffered_len(), 0);
        assert_eq!(rec.frame_counter(), 0);
        assert!(!rec.is_armed());
    }

    #[test]
    fn zero_length_clips_are_rejected() {
        let writer = RecordingWriter { written: Arc::default(), fail: false };
        assert!(ClipRecorder::new("detections", 0, Box::new(writer)).is_err());
    }

    #[test]
    fn huge_clip_length_allocates_nothing_up_front() {
        let writer = RecordingWriter { written: Arc::default(), fail: false };
        let mut rec = ClipRecorder::new("detections", usize::MAX, Box::new(writer)).unwrap();
        assert_eq!(rec.clip_frames(), usize::MAX);
        assert_eq!(
            rec.push(&RgbImage::new(2, 2), &person(), at(3, 0, 0)),
            RecorderEvent::Buffered { count: 1 }
        );
    }

    #[test]
    fn clips_flushed_in_the_same_second_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = ClipRecorder::new(dir.path(), 1, Box::new(GifClipWriter::new(20))).unwrap();
        let frame = RgbImage::new(4, 4);

        let first = rec.push(&frame, &person(), at(8, 30, 0));
        let second = rec.push(&frame, &person(), at(8, 30, 0));

        let day = dir.path().join("2024-05-01");
        assert_eq!(first, RecorderEvent::Flushed { path: day.join("08-30-00.gif"), frames: 1 });
        assert_eq!(second, RecorderEvent::Flushed { path: day.join("08-30-00-1.gif"), frames: 1 });
        assert!(day.join("08-30-00.gif").is_file());
        assert!(day.join("08-30-00-1.gif").is_file());
    }
}
