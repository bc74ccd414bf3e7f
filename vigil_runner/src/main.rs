// THEORY:
// `vigil` is the operator-facing binary. It turns command-line flags (each with a
// `VIGIL_*` environment fallback) into a `PipelineConfig`, builds the concrete
// collaborators, and runs the pipeline on a single-threaded runtime until the
// stream ends or the operator quits.
//
// The default build is pure Rust: image-sequence input, the library's own
// background models, the contour localizer and GIF clips. Building with
// `--features opencv` adds camera/video input, MOG2/KNN, OpenCV corner and
// flow tracking, darknet inference, AVI clips and the highgui windows.

#[cfg(feature = "opencv")]
mod opencv_backend;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vigil_vision::VisionError;
use vigil_vision::core_modules::background::AlgorithmKind;
use vigil_vision::core_modules::canvas::LabelFont;
use vigil_vision::core_modules::contour_localizer::ContourLocalizer;
use vigil_vision::core_modules::localizer::{Localizer, LocalizerKind};
#[cfg(not(feature = "opencv"))]
use vigil_vision::core_modules::network_localizer::DetectionBackend;
use vigil_vision::core_modules::network_localizer::{ModelContext, ModelPaths, NetworkLocalizer};
use vigil_vision::core_modules::source::{FrameSource, ImageSequenceSource, SourceSpec};
use vigil_vision::core_modules::tracker::TrailMode;
#[cfg(feature = "opencv")]
use vigil_vision::core_modules::tracker::{Palette, TrajectoryTracker};
use vigil_vision::pipeline::{ControlHandle, DisplaySink, NullSink, PipelineConfig, SentinelPipeline};

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Motion-gated video surveillance")]
struct Args {
    /// Capture device index, video file, stream URL or directory of frames
    #[arg(short, long, env = "VIGIL_SOURCE", default_value = "0")]
    source: SourceSpec,

    /// Background model: adaptive or nearest-neighbor
    #[arg(short, long, env = "VIGIL_ALGORITHM", default_value = "adaptive")]
    algorithm: AlgorithmKind,

    /// Localizer: network or contour
    #[arg(short, long, env = "VIGIL_LOCALIZER", default_value = "network")]
    localizer: LocalizerKind,

    /// Record clips when a person is detected
    #[arg(long, env = "VIGIL_RECORD", default_value_t = true, action = ArgAction::Set)]
    record: bool,

    /// Foreground pixels a frame must exceed to count as motion
    #[arg(short, long, env = "VIGIL_THRESHOLD", default_value_t = 10)]
    threshold: usize,

    /// Frames per recorded clip
    #[arg(long, env = "VIGIL_CLIP_FRAMES", default_value_t = 200)]
    clip_frames: usize,

    #[arg(long, env = "VIGIL_CLIP_FPS", default_value_t = 20)]
    clip_fps: u32,

    /// Clips land in <output>/<YYYY-MM-DD>/<HH-MM-SS>.<ext>
    #[arg(short, long, env = "VIGIL_OUTPUT", default_value = "detections")]
    output: PathBuf,

    #[arg(long, env = "VIGIL_BORDER", default_value_t = 10)]
    border: u32,

    /// Trail source: same-frame or consecutive
    #[arg(long, env = "VIGIL_TRAIL_MODE", default_value = "same-frame")]
    trail_mode: TrailMode,

    #[arg(long, env = "VIGIL_MODEL_CONFIG", default_value = "./darknet_cfg/yolov4-tiny.cfg")]
    model_config: PathBuf,

    #[arg(long, env = "VIGIL_MODEL_DATA", default_value = "./darknet_cfg/coco.data")]
    model_data: PathBuf,

    #[arg(long, env = "VIGIL_MODEL_WEIGHTS", default_value = "./darknet_cfg/yolov4-tiny.weights")]
    model_weights: PathBuf,

    /// Minimum detection confidence
    #[arg(long, env = "VIGIL_DETECTION_THRESHOLD", default_value_t = 0.5)]
    detection_threshold: f32,

    #[arg(long, env = "VIGIL_NMS_THRESHOLD", default_value_t = 0.45)]
    nms_threshold: f32,

    /// TrueType font for detection labels; boxes are unlabeled without it
    #[arg(long, env = "VIGIL_FONT")]
    font: Option<PathBuf>,

    /// Run headless
    #[arg(long, env = "VIGIL_NO_DISPLAY")]
    no_display: bool,

    /// Save the accumulated trail overlay here at shutdown
    #[arg(long, env = "VIGIL_SAVE_TRAILS")]
    save_trails: Option<PathBuf>,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            occupancy_threshold: self.threshold,
            border_width: self.border,
            recording_enabled: self.record,
            clip_frames: self.clip_frames,
            output_root: self.output.clone(),
            clip_fps: self.clip_fps,
            algorithm: self.algorithm,
            trail_mode: self.trail_mode,
        }
    }

    fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            config: self.model_config.clone(),
            data: self.model_data.clone(),
            weights: self.model_weights.clone(),
        }
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
}

fn build_localizer(args: &Args) -> Result<Box<dyn Localizer>> {
    match args.localizer {
        LocalizerKind::Contour => Ok(Box::new(ContourLocalizer::default())),
        LocalizerKind::Network => {
            let font = args
                .font
                .as_deref()
                .map(LabelFont::load)
                .transpose()
                .context("Failed to load label font")?;

            #[cfg(feature = "opencv")]
            let build = |paths: &ModelPaths| {
                opencv_backend::DarknetBackend::load(paths, args.detection_threshold, args.nms_threshold)
            };
            #[cfg(not(feature = "opencv"))]
            let build = |_: &ModelPaths| -> vigil_vision::VisionResult<Box<dyn DetectionBackend>> {
                Err(VisionError::BackendUnavailable(
                    "network localizer needs the `opencv` feature; use --localizer contour".into(),
                ))
            };

            let context = ModelContext::load(&args.model_paths(), build).context("Failed to load detection model")?;
            Ok(Box::new(NetworkLocalizer::new(context, font)))
        }
    }
}

#[cfg(feature = "opencv")]
fn build_pipeline(config: PipelineConfig, localizer: Box<dyn Localizer>) -> Result<SentinelPipeline> {
    let subtractor = Box::new(opencv_backend::OpenCvSubtractor::new(config.algorithm)?);
    let writer = Box::new(opencv_backend::AviClipWriter::new(config.clip_fps));
    let tracker = TrajectoryTracker::new(config.trail_mode, Palette::random())
        .with_operator(Box::new(opencv_backend::OpenCvFlow::default()));
    Ok(SentinelPipeline::new(config, subtractor, localizer, writer)?.with_tracker(tracker))
}

#[cfg(not(feature = "opencv"))]
fn build_pipeline(config: PipelineConfig, localizer: Box<dyn Localizer>) -> Result<SentinelPipeline> {
    Ok(SentinelPipeline::from_config(config, localizer)?)
}

fn build_source(spec: &SourceSpec) -> Result<Box<dyn FrameSource>> {
    match spec {
        SourceSpec::Path(path) if path.is_dir() => Ok(Box::new(ImageSequenceSource::new(path.clone()))),
        #[cfg(feature = "opencv")]
        other => Ok(Box::new(opencv_backend::VideoCaptureSource::new(other.clone()))),
        #[cfg(not(feature = "opencv"))]
        other => Err(VisionError::BackendUnavailable(format!(
            "{other:?} needs the `opencv` feature; pass a directory of frames instead"
        ))
        .into()),
    }
}

fn build_sink(args: &Args) -> Result<Box<dyn DisplaySink>> {
    if args.no_display {
        return Ok(Box::new(NullSink));
    }
    #[cfg(feature = "opencv")]
    {
        Ok(Box::new(opencv_backend::HighGuiSink::new()?))
    }
    #[cfg(not(feature = "opencv"))]
    {
        warn!("Built without the `opencv` feature, running headless");
        Ok(Box::new(NullSink))
    }
}

/// Maps `q` and `p` lines on stdin and Ctrl-C onto the control handle.
fn spawn_controls(control: &ControlHandle) {
    let stdin_control = control.clone();
    // a plain thread: a blocked stdin read must not hold up runtime shutdown
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "q" => {
                    stdin_control.stop();
                    break;
                }
                "p" => stdin_control.toggle_pause(),
                "" => {}
                other => warn!(command = other, "Unknown command (q quits, p pauses)"),
            }
        }
    });

    let signal_control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            signal_control.stop();
        }
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.pipeline_config();
    info!(?config, "Starting vigil");

    let localizer = build_localizer(&args)?;
    let mut pipeline = build_pipeline(config, localizer).context("Failed to build pipeline")?;
    let mut source = build_source(&args.source)?;
    let mut sink = build_sink(&args)?;

    let control = ControlHandle::new();
    spawn_controls(&control);

    let summary = pipeline
        .run(source.as_mut(), sink.as_mut(), &control)
        .await
        .context("Pipeline run failed")?;

    if let Some(path) = &args.save_trails {
        if let Some(overlay) = pipeline.take_overlay() {
            overlay
                .finish()
                .save(path)
                .with_context(|| format!("Failed to save trails to {}", path.display()))?;
            info!(path = %path.display(), "Trails saved");
        }
    }

    info!(
        frames = summary.frames,
        gated = summary.gated_frames,
        clips = summary.clips_written,
        "Done"
    );
    Ok(())
}
