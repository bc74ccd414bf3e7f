// THEORY:
// The `pipeline` module is the final, top-level API for the entire surveillance
// engine. It wires the stages in `core_modules` into the per-frame decision
// logic and owns the state that lives across frames: the background model, the
// trail overlay and the clip recorder.
//
// Each frame flows strictly forward:
// 1.  **Acquisition**: The first frame fixes the stream dimensions and creates
//     the overlay. A later frame of a different size ends the run.
// 2.  **Background Subtraction**: The operator produces the foreground mask and
//     keeps learning.
// 3.  **Motion Gate**: A cheap pixel count decides whether the expensive stages
//     run at all. Below the threshold the frame is only framed in red.
// 4.  **Localization, Tracking, Recording**: On a gated frame the localizer
//     labels objects, the tracker strokes the overlay, and the recorder is
//     offered the annotated frame. The frame is framed in green.
// 5.  **Composition**: The bordered frame and the overlay are added with
//     saturation into the frame that gets presented.
//
// `process_frame` is that step, synchronous and deterministic. `run` drives it
// from a `FrameSource` into a `DisplaySink` on an async loop that honours the
// pause/stop state published through a `ControlHandle`.

use crate::core_modules::background::{AlgorithmKind, BackgroundSubtractor, create_subtractor};
use crate::core_modules::canvas::{GREEN, RED, pad_with_border, saturating_add};
use crate::core_modules::clip_writer::{ClipWriter, GifClipWriter};
use crate::core_modules::frame::{ForegroundMask, Frame};
use crate::core_modules::localizer::{Detection, Localizer};
use crate::core_modules::motion_gate::{DEFAULT_OCCUPANCY_THRESHOLD, is_occupied};
use crate::core_modules::recorder::{ClipRecorder, DEFAULT_CLIP_FRAMES};
use crate::core_modules::source::FrameSource;
use crate::core_modules::tracker::{Palette, TrackOverlay, TrailMode, TrajectoryTracker};
use crate::error::{VisionError, VisionResult};
use chrono::NaiveDateTime;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

// Re-export key data structures for the public API.
pub use crate::core_modules::recorder::{RecorderEvent, RecorderState};

const DEFAULT_BORDER_WIDTH: u32 = 10;
const DEFAULT_CLIP_FPS: u32 = 20;
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Configuration for the SentinelPipeline. `Default` gives the stock values.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// A frame is gated when strictly more foreground pixels than this are set.
    pub occupancy_threshold: usize,
    pub border_width: u32,
    pub recording_enabled: bool,
    /// Frames per clip; reaching it is what flushes a clip.
    pub clip_frames: usize,
    pub output_root: PathBuf,
    pub clip_fps: u32,
    pub algorithm: AlgorithmKind,
    pub trail_mode: TrailMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            occupancy_threshold: DEFAULT_OCCUPANCY_THRESHOLD,
            border_width: DEFAULT_BORDER_WIDTH,
            recording_enabled: true,
            clip_frames: DEFAULT_CLIP_FRAMES,
            output_root: PathBuf::from("detections"),
            clip_fps: DEFAULT_CLIP_FPS,
            algorithm: AlgorithmKind::Adaptive,
            trail_mode: TrailMode::SameFrame,
        }
    }
}

/// Everything the pipeline decided about one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub index: u64,
    pub occupied: bool,
    /// Number of set pixels in `mask`.
    pub occupancy: usize,
    pub detections: Vec<Detection>,
    pub recorder: RecorderEvent,
    /// Bordered frame plus overlay, ready to present.
    pub composite: RgbImage,
    /// The operator's raw foreground mask.
    pub mask: ForegroundMask,
}

/// Totals for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub gated_frames: u64,
    pub clips_written: u64,
    pub clips_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Running,
    Paused,
    Stopped,
}

/// Requests raised by a display (key presses) or any other control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Quit,
    TogglePause,
}

/// Shared handle that publishes the run state to the processing loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    state_tx: Arc<watch::Sender<RunState>>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(RunState::Running);
        Self {
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    pub fn pause(&self) {
        self.state_tx.send_if_modified(|state| {
            let changed = *state == RunState::Running;
            if changed {
                *state = RunState::Paused;
            }
            changed
        });
    }

    pub fn resume(&self) {
        self.state_tx.send_if_modified(|state| {
            let changed = *state == RunState::Paused;
            if changed {
                *state = RunState::Running;
            }
            changed
        });
    }

    pub fn toggle_pause(&self) {
        match self.state() {
            RunState::Running => self.pause(),
            RunState::Paused => self.resume(),
            RunState::Stopped => {}
        }
    }

    /// Stopping is final.
    pub fn stop(&self) {
        self.state_tx.send_replace(RunState::Stopped);
    }

    pub fn apply(&self, command: ControlCommand) {
        match command {
            ControlCommand::Quit => self.stop(),
            ControlCommand::TogglePause => self.toggle_pause(),
        }
    }
}

/// Where composited frames go.
pub trait DisplaySink {
    /// Shows one processed frame. A returned command is applied before the next
    /// frame is read.
    fn present(&mut self, report: &FrameReport) -> VisionResult<Option<ControlCommand>>;

    /// Called repeatedly while paused so the display stays responsive.
    fn poll_command(&mut self) -> VisionResult<Option<ControlCommand>> {
        Ok(None)
    }
}

/// Headless operation.
#[derive(Debug, Default)]
pub struct NullSink;

impl DisplaySink for NullSink {
    fn present(&mut self, _report: &FrameReport) -> VisionResult<Option<ControlCommand>> {
        Ok(None)
    }
}

type Clock = Box<dyn FnMut() -> NaiveDateTime>;

/// The main, top-level struct for the surveillance engine.
pub struct SentinelPipeline {
    config: PipelineConfig,
    subtractor: Box<dyn BackgroundSubtractor>,
    localizer: Box<dyn Localizer>,
    tracker: TrajectoryTracker,
    recorder: Option<ClipRecorder>,
    overlay: Option<TrackOverlay>,
    clock: Clock,
    summary: RunSummary,
}

impl SentinelPipeline {
    /// Builds a pipeline from explicit collaborators. `writer` is only used when
    /// recording is enabled.
    pub fn new(
        config: PipelineConfig,
        subtractor: Box<dyn BackgroundSubtractor>,
        localizer: Box<dyn Localizer>,
        writer: Box<dyn ClipWriter>,
    ) -> VisionResult<Self> {
        let recorder = if config.recording_enabled {
            Some(ClipRecorder::new(config.output_root.clone(), config.clip_frames, writer)?)
        } else {
            None
        };
        let tracker = TrajectoryTracker::new(config.trail_mode, Palette::random());
        Ok(Self {
            config,
            subtractor,
            localizer,
            tracker,
            recorder,
            overlay: None,
            clock: Box::new(|| chrono::Local::now().naive_local()),
            summary: RunSummary::default(),
        })
    }

    /// Builds a pipeline with the pure-Rust background operator and GIF clips.
    pub fn from_config(config: PipelineConfig, localizer: Box<dyn Localizer>) -> VisionResult<Self> {
        let subtractor = create_subtractor(config.algorithm);
        let writer = Box::new(GifClipWriter::new(config.clip_fps));
        Self::new(config, subtractor, localizer, writer)
    }

    pub fn with_tracker(mut self, tracker: TrajectoryTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Replaces the wall clock used to name clips.
    pub fn with_clock(mut self, clock: impl FnMut() -> NaiveDateTime + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn recorder(&self) -> Option<&ClipRecorder> {
        self.recorder.as_ref()
    }

    pub fn overlay(&self) -> Option<&TrackOverlay> {
        self.overlay.as_ref()
    }

    /// Tears the overlay down, returning it. The next frame starts a new one.
    pub fn take_overlay(&mut self) -> Option<TrackOverlay> {
        self.overlay.take()
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Runs one frame through every stage.
    pub fn process_frame(&mut self, image: RgbImage) -> VisionResult<FrameReport> {
        let dimensions = image.dimensions();
        let border = self.config.border_width;
        let overlay = self
            .overlay
            .get_or_insert_with(|| TrackOverlay::new(dimensions.0, dimensions.1, border));
        let expected = (
            overlay.dimensions().0 - 2 * border,
            overlay.dimensions().1 - 2 * border,
        );
        if expected != dimensions {
            return Err(VisionError::FrameSizeChanged {
                expected,
                actual: dimensions,
            });
        }

        let index = self.summary.frames;
        let frame = Frame::new(index, image);
        let mask = self.subtractor.apply(&frame)?;
        let occupancy = mask.occupancy();
        let occupied = is_occupied(&mask, self.config.occupancy_threshold);

        let (bordered, detections, recorder) = if occupied {
            let localization = self.localizer.localize(&frame, &mask);
            let tracking_mask = localization.refined_mask.as_ref().unwrap_or(&mask);
            let update = self
                .tracker
                .update(&frame, tracking_mask, &localization.annotated, overlay)?;
            debug!(
                frame = index,
                occupancy,
                detections = localization.detections.len(),
                points = update.points.len(),
                "Motion gated frame"
            );

            let event = match self.recorder.as_mut() {
                Some(recorder) => {
                    let now = (self.clock)();
                    recorder.push(&localization.annotated, &localization.detections, now)
                }
                None => RecorderEvent::Ignored,
            };
            (
                pad_with_border(&update.annotated, border, GREEN),
                localization.detections,
                event,
            )
        } else {
            (
                pad_with_border(&frame.image, border, RED),
                Vec::new(),
                RecorderEvent::Ignored,
            )
        };

        let composite = saturating_add(&bordered, overlay.image());

        self.summary.frames += 1;
        if occupied {
            self.summary.gated_frames += 1;
        }
        match &recorder {
            RecorderEvent::Flushed { .. } => self.summary.clips_written += 1,
            RecorderEvent::FlushFailed { .. } => self.summary.clips_failed += 1,
            _ => {}
        }

        Ok(FrameReport {
            index,
            occupied,
            occupancy,
            detections,
            recorder,
            composite,
            mask,
        })
    }

    /// Drives frames from `source` into `sink` until end of stream or stop.
    ///
    /// The source is opened here and released on every exit path.
    pub async fn run(
        &mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn DisplaySink,
        control: &ControlHandle,
    ) -> VisionResult<RunSummary> {
        if let Err(e) = source.open() {
            error!(error = %e, "Unable to open frame source");
            return Err(e);
        }
        info!("Pipeline started");

        let outcome = self.run_loop(source, sink, control).await;
        source.release();

        match &outcome {
            Ok(summary) => info!(
                frames = summary.frames,
                gated = summary.gated_frames,
                clips = summary.clips_written,
                failed_clips = summary.clips_failed,
                "Pipeline stopped"
            ),
            Err(e) => error!(error = %e, "Pipeline aborted"),
        }
        outcome
    }

    async fn run_loop(
        &mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn DisplaySink,
        control: &ControlHandle,
    ) -> VisionResult<RunSummary> {
        let mut state_rx = control.subscribe();
        loop {
            if *state_rx.borrow_and_update() == RunState::Stopped {
                info!("Stop requested");
                break;
            }

            let Some(image) = source.read_next_frame()? else {
                info!("End of stream");
                break;
            };
            let report = self.process_frame(image)?;
            if let Some(command) = sink.present(&report)? {
                control.apply(command);
            }

            wait_while_paused(&mut state_rx, sink, control).await?;
            tokio::task::yield_now().await;
        }
        Ok(self.summary)
    }
}

/// Blocks the loop between frames while the state is `Paused`.
async fn wait_while_paused(
    state_rx: &mut watch::Receiver<RunState>,
    sink: &mut dyn DisplaySink,
    control: &ControlHandle,
) -> VisionResult<()> {
    let mut announced = false;
    loop {
        if *state_rx.borrow_and_update() != RunState::Paused {
            if announced {
                info!("Resumed");
            }
            return Ok(());
        }
        if !announced {
            info!("Paused");
            announced = true;
        }

        if let Some(command) = sink.poll_command()? {
            control.apply(command);
            continue;
        }
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
        }
    }
}
