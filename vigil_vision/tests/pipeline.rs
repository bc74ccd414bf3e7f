use chrono::{Duration, NaiveDate, NaiveDateTime};
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, GrayImage, Luma, Rgb, RgbImage};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use vigil_vision::core_modules::background::{AdaptiveParams, AdaptiveSubtractor, BackgroundSubtractor};
use vigil_vision::core_modules::clip_writer::{ClipWriter, GifClipWriter};
use vigil_vision::core_modules::contour_localizer::ContourLocalizer;
use vigil_vision::core_modules::frame::{FOREGROUND, ForegroundMask, Frame};
use vigil_vision::core_modules::localizer::{BoundingBox, Detection, Localization, Localizer};
use vigil_vision::core_modules::source::MemorySource;
use vigil_vision::core_modules::tracker::{Palette, TrailMode, TrajectoryTracker};
use vigil_vision::pipeline::{
    ControlHandle, DisplaySink, FrameReport, PipelineConfig, RecorderEvent, RecorderState, SentinelPipeline,
};
use vigil_vision::{VisionError, VisionResult};

const WIDTH: u32 = 48;
const HEIGHT: u32 = 36;

/// Foreground wherever the red channel is lit.
struct RedSubtractor;

impl BackgroundSubtractor for RedSubtractor {
    fn apply(&mut self, frame: &Frame) -> VisionResult<ForegroundMask> {
        let cells = GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
            Luma([if frame.image.get_pixel(x, y)[0] > 0 { FOREGROUND } else { 0 }])
        });
        Ok(ForegroundMask::new(cells))
    }
}

/// Sees a person whenever the top-left pixel has a lit green channel.
struct TaggedPersonLocalizer;

impl Localizer for TaggedPersonLocalizer {
    fn localize(&mut self, frame: &Frame, _mask: &ForegroundMask) -> Localization {
        let detections = if frame.image.get_pixel(0, 0)[1] > 0 {
            vec![Detection::new("person", 0.9, BoundingBox { x: 12, y: 8, width: 10, height: 10 })]
        } else {
            vec![Detection::new("dog", 0.9, BoundingBox { x: 12, y: 8, width: 10, height: 10 })]
        };
        Localization {
            annotated: frame.image.clone(),
            detections,
            refined_mask: None,
        }
    }
}

struct FailingWriter;

impl ClipWriter for FailingWriter {
    fn extension(&self) -> &str {
        "gif"
    }

    fn write(&mut self, _: &[RgbImage], _: u32, _: u32, destination: &Path) -> VisionResult<()> {
        Err(VisionError::clip_write(destination, "read-only filesystem"))
    }
}

fn synthetic(motion: bool, person: bool, shade: u8) -> RgbImage {
    let mut image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([0, 0, 40]));
    if motion {
        for y in 8..18 {
            for x in 12..22 {
                image.put_pixel(x, y, Rgb([200, shade, 40]));
            }
        }
    }
    if person {
        image.put_pixel(0, 0, Rgb([0, 255, 40]));
    }
    image
}

fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 30).unwrap().and_hms_opt(23, 59, 0).unwrap()
}

/// A clock that advances one second per reading.
fn ticking_clock() -> impl FnMut() -> NaiveDateTime + 'static {
    let mut readings = 0i64;
    move || {
        let now = base_time() + Duration::seconds(readings);
        readings += 1;
        now
    }
}

fn config(root: &Path, clip_frames: usize) -> PipelineConfig {
    PipelineConfig {
        output_root: root.to_path_buf(),
        clip_frames,
        ..PipelineConfig::default()
    }
}

fn scripted_pipeline(config: PipelineConfig, writer: Box<dyn ClipWriter>) -> SentinelPipeline {
    SentinelPipeline::new(config, Box::new(RedSubtractor), Box::new(TaggedPersonLocalizer), writer)
        .unwrap()
        .with_tracker(TrajectoryTracker::new(TrailMode::SameFrame, Palette::seeded(11)))
        .with_clock(ticking_clock())
}

#[test]
fn five_frame_stream_gates_and_arms_on_motion_frames_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = scripted_pipeline(config(dir.path(), 200), Box::new(GifClipWriter::new(20)));

    let mut gated = Vec::new();
    for index in 0..5 {
        let active = index >= 2;
        let report = pipeline.process_frame(synthetic(active, active, 100)).unwrap();
        assert_eq!(report.index, index);
        gated.push(report.occupied);

        let recorder = pipeline.recorder().unwrap();
        match index {
            0 | 1 => {
                assert_eq!(report.recorder, RecorderEvent::Ignored);
                assert_eq!(recorder.state(), RecorderState::Idle);
            }
            2 => {
                assert_eq!(report.recorder, RecorderEvent::Buffered { count: 1 });
                assert_eq!(recorder.state(), RecorderState::Recording);
                assert!(recorder.is_armed());
            }
            _ => assert!(matches!(report.recorder, RecorderEvent::Buffered { .. })),
        }
    }

    assert_eq!(gated, vec![false, false, true, true, true]);
    let recorder = pipeline.recorder().unwrap();
    assert_eq!(recorder.frame_counter(), 3);
    assert_eq!(recorder.buffered_len(), 3);
    assert!(!dir.path().join("2024-06-30").exists());
}

#[test]
fn two_hundred_gated_frames_make_exactly_one_clip_named_at_flush_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = scripted_pipeline(config(dir.path(), 200), Box::new(GifClipWriter::new(20)));

    let mut flushed = Vec::new();
    for i in 0..200u32 {
        let report = pipeline
            .process_frame(synthetic(true, i == 0, (i % 250) as u8))
            .unwrap();
        assert!(report.occupied);
        let recorder = pipeline.recorder().unwrap();
        assert!(recorder.buffered_len() <= 200);
        if let RecorderEvent::Flushed { path, frames } = report.recorder {
            flushed.push((i, path, frames));
        }
    }

    // the clock was read once per gated frame; the 200th reading names the clip
    let expected = dir.path().join("2024-07-01").join("00-02-19.gif");
    assert_eq!(flushed, vec![(199, expected.clone(), 200)]);

    let recorder = pipeline.recorder().unwrap();
    assert_eq!(recorder.buffered_len(), 0);
    assert_eq!(recorder.frame_counter(), 0);
    assert_eq!(pipeline.summary().clips_written, 1);

    let decoder = GifDecoder::new(BufReader::new(File::open(&expected).unwrap())).unwrap();
    let frames = decoder.into_frames().collect_frames().unwrap();
    assert_eq!(frames.len(), 200);
    assert_eq!(frames[0].buffer().dimensions(), (WIDTH, HEIGHT));
}

#[test]
fn no_person_means_no_clip() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = scripted_pipeline(config(dir.path(), 20), Box::new(GifClipWriter::new(20)));

    for i in 0..60u32 {
        let report = pipeline.process_frame(synthetic(i % 3 != 0, false, 50)).unwrap();
        assert_eq!(report.recorder, RecorderEvent::Ignored);
    }
    assert_eq!(pipeline.recorder().unwrap().frame_counter(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn failed_flush_is_reported_and_recording_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = scripted_pipeline(config(dir.path(), 4), Box::new(FailingWriter));

    let mut events = Vec::new();
    for i in 0..6u32 {
        let person = i == 0 || i == 4;
        events.push(pipeline.process_frame(synthetic(true, person, 9)).unwrap().recorder);
    }

    assert!(matches!(&events[3], RecorderEvent::FlushFailed { error, .. } if error.contains("read-only")));
    assert_eq!(events[4], RecorderEvent::Buffered { count: 1 });
    assert_eq!(events[5], RecorderEvent::Buffered { count: 2 });
    assert_eq!(pipeline.summary().clips_failed, 1);
}

#[test]
fn contour_localizer_boxes_motion_but_never_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = SentinelPipeline::new(
        config(dir.path(), 3),
        Box::new(RedSubtractor),
        Box::new(ContourLocalizer::default()),
        Box::new(GifClipWriter::new(20)),
    )
    .unwrap();

    for _ in 0..5 {
        let report = pipeline.process_frame(synthetic(true, true, 0)).unwrap();
        assert_eq!(report.detections.len(), 1);
        assert_eq!(report.detections[0].bounding_box, BoundingBox { x: 12, y: 8, width: 10, height: 10 });
        assert_eq!(report.recorder, RecorderEvent::Ignored);
    }
}

#[test]
fn adaptive_background_gates_only_when_something_moves() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        recording_enabled: false,
        ..config(dir.path(), 200)
    };
    let mut pipeline = SentinelPipeline::new(
        config,
        Box::new(AdaptiveSubtractor::new(AdaptiveParams::default())),
        Box::new(TaggedPersonLocalizer),
        Box::new(GifClipWriter::new(20)),
    )
    .unwrap();

    let mut gated = Vec::new();
    for i in 0..8 {
        let report = pipeline.process_frame(synthetic(i >= 6, false, 0)).unwrap();
        gated.push(report.occupied);
    }
    assert_eq!(gated, vec![false, false, false, false, false, false, true, true]);
}

struct Collect(Vec<(u64, bool)>);

impl DisplaySink for Collect {
    fn present(&mut self, report: &FrameReport) -> VisionResult<Option<vigil_vision::pipeline::ControlCommand>> {
        self.0.push((report.index, report.occupied));
        Ok(None)
    }
}

#[tokio::test]
async fn paused_from_another_task_and_resumed_sees_every_frame_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = scripted_pipeline(config(dir.path(), 200), Box::new(GifClipWriter::new(20)));
    let frames: Vec<RgbImage> = (0..5).map(|i| synthetic(i >= 2, i == 2, 10)).collect();
    let mut source = MemorySource::new(frames);
    let mut sink = Collect(Vec::new());

    let control = ControlHandle::new();
    control.pause();
    let remote = control.clone();
    let resumer = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        remote.resume();
    });

    let summary = pipeline.run(&mut source, &mut sink, &control).await.unwrap();
    resumer.await.unwrap();

    assert_eq!(summary.frames, 5);
    assert_eq!(summary.gated_frames, 3);
    assert_eq!(
        sink.0,
        vec![(0, false), (1, false), (2, true), (3, true), (4, true)]
    );
    assert!(source.is_released());
}
