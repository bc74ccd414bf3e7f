// THEORY:
// OpenCV-backed implementations of the library's collaborator traits. They are
// compiled only with the `opencv` feature and give the runner camera and video
// input, the MOG2/KNN background models, Shi-Tomasi corners with pyramidal
// Lucas-Kanade flow, darknet inference through the DNN module, MJPG AVI clips
// and the two highgui windows.
//
// Everything crossing this boundary is converted between OpenCV's BGR `Mat`s and
// the RGB `image` buffers the library works with.

use image::{GrayImage, RgbImage};
use opencv::core::{self, Mat, Point2f, Ptr, Rect, Scalar, Size, TermCriteria, Vector};
use opencv::prelude::*;
use opencv::{dnn, highgui, imgproc, video, videoio};
use std::path::Path;
use tracing::{debug, info};
use vigil_vision::core_modules::background::{AlgorithmKind, BackgroundSubtractor};
use vigil_vision::core_modules::clip_writer::ClipWriter;
use vigil_vision::core_modules::frame::{ForegroundMask, Frame};
use vigil_vision::core_modules::features::FeatureParams;
use vigil_vision::core_modules::network_localizer::{DetectionBackend, ModelPaths, RawDetection};
use vigil_vision::core_modules::optical_flow::{FlowParams, FlowPoint};
use vigil_vision::core_modules::source::{FrameSource, SourceSpec};
use vigil_vision::core_modules::tracker::FlowOperator;
use vigil_vision::pipeline::{ControlCommand, DisplaySink, FrameReport};
use vigil_vision::{VisionError, VisionResult};

const OUTPUT_WINDOW: &str = "Output";
const MASK_WINDOW: &str = "Mask";
const MOG2_VAR_THRESHOLD: f64 = 40.0;
const KNN_DIST2_THRESHOLD: f64 = 400.0;
const BACKGROUND_HISTORY: i32 = 500;
const DEFAULT_NETWORK_SIDE: u32 = 416;

fn rgb_mat(image: &RgbImage) -> opencv::Result<Mat> {
    let (width, height) = image.dimensions();
    let mut rgb = Mat::new_rows_cols_with_default(height as i32, width as i32, core::CV_8UC3, Scalar::all(0.0))?;
    rgb.data_bytes_mut()?.copy_from_slice(image.as_raw());
    Ok(rgb)
}

fn rgb_to_bgr_mat(image: &RgbImage) -> opencv::Result<Mat> {
    let rgb = rgb_mat(image)?;
    let mut bgr = Mat::default();
    imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr)
}

fn bgr_mat_to_rgb(mat: &Mat) -> opencv::Result<Option<RgbImage>> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let size = rgb.size()?;
    Ok(RgbImage::from_raw(size.width as u32, size.height as u32, rgb.data_bytes()?.to_vec()))
}

fn gray_to_mat(gray: &GrayImage) -> opencv::Result<Mat> {
    let (width, height) = gray.dimensions();
    let mut mat = Mat::new_rows_cols_with_default(height as i32, width as i32, core::CV_8UC1, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(gray.as_raw());
    Ok(mat)
}

/// Camera, video file or stream input.
pub struct VideoCaptureSource {
    spec: SourceSpec,
    capture: Option<videoio::VideoCapture>,
}

impl VideoCaptureSource {
    pub fn new(spec: SourceSpec) -> Self {
        Self { spec, capture: None }
    }
}

impl FrameSource for VideoCaptureSource {
    fn open(&mut self) -> VisionResult<()> {
        let capture = match &self.spec {
            SourceSpec::Device(index) => videoio::VideoCapture::new(*index, videoio::CAP_ANY),
            SourceSpec::Path(path) => videoio::VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY),
        }
        .map_err(|e| VisionError::SourceOpen(format!("{:?}: {e}", self.spec)))?;

        if !capture.is_opened().unwrap_or(false) {
            return Err(VisionError::SourceOpen(format!("{:?}", self.spec)));
        }
        info!(source = ?self.spec, "Capture opened");
        self.capture = Some(capture);
        Ok(())
    }

    fn read_next_frame(&mut self) -> VisionResult<Option<RgbImage>> {
        let Some(capture) = self.capture.as_mut() else {
            return Err(VisionError::SourceRead("capture is not open".into()));
        };
        let mut frame = Mat::default();
        let grabbed = capture
            .read(&mut frame)
            .map_err(|e| VisionError::SourceRead(e.to_string()))?;
        if !grabbed || frame.empty() {
            return Ok(None);
        }
        bgr_mat_to_rgb(&frame).map_err(|e| VisionError::SourceRead(e.to_string()))
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                debug!(error = %e, "Capture release failed");
            }
        }
    }
}

enum Model {
    Mog2(Ptr<video::BackgroundSubtractorMOG2>),
    Knn(Ptr<video::BackgroundSubtractorKNN>),
}

/// OpenCV's MOG2 or KNN background model.
pub struct OpenCvSubtractor {
    model: Model,
}

impl OpenCvSubtractor {
    pub fn new(kind: AlgorithmKind) -> VisionResult<Self> {
        let model = match kind {
            AlgorithmKind::Adaptive => Model::Mog2(
                video::create_background_subtractor_mog2(BACKGROUND_HISTORY, MOG2_VAR_THRESHOLD, true)
                    .map_err(|e| VisionError::BackendUnavailable(e.to_string()))?,
            ),
            AlgorithmKind::NearestNeighbor => Model::Knn(
                video::create_background_subtractor_knn(BACKGROUND_HISTORY, KNN_DIST2_THRESHOLD, true)
                    .map_err(|e| VisionError::BackendUnavailable(e.to_string()))?,
            ),
        };
        Ok(Self { model })
    }
}

impl BackgroundSubtractor for OpenCvSubtractor {
    fn apply(&mut self, frame: &Frame) -> VisionResult<ForegroundMask> {
        // negative lets OpenCV pick its automatic rate
        let learning_rate = -1.0;
        let convert = |e: opencv::Error| VisionError::SourceRead(format!("background model: {e}"));

        let input = rgb_to_bgr_mat(&frame.image).map_err(convert)?;
        let mut mask = Mat::default();
        match &mut self.model {
            Model::Mog2(model) => model.apply(&input, &mut mask, learning_rate),
            Model::Knn(model) => model.apply(&input, &mut mask, learning_rate),
        }
        .map_err(convert)?;

        let (width, height) = frame.dimensions();
        let cells = GrayImage::from_raw(width, height, mask.data_bytes().map_err(convert)?.to_vec())
            .ok_or_else(|| VisionError::SourceRead("background mask has unexpected size".into()))?;
        Ok(ForegroundMask::new(cells))
    }
}

/// `goodFeaturesToTrack` plus `calcOpticalFlowPyrLK`, with the same parameters
/// as the pure-Rust operator.
#[derive(Debug, Clone, Default)]
pub struct OpenCvFlow {
    pub features: FeatureParams,
    pub flow: FlowParams,
}

impl FlowOperator for OpenCvFlow {
    fn select_corners(&mut self, gray: &GrayImage, mask: &ForegroundMask) -> VisionResult<Vec<(f32, f32)>> {
        let convert = |e: opencv::Error| VisionError::SourceRead(format!("corner selection: {e}"));
        let image = gray_to_mat(gray).map_err(convert)?;
        let mask = gray_to_mat(mask.as_gray()).map_err(convert)?;
        let mut corners = Vector::<Point2f>::new();
        imgproc::good_features_to_track(
            &image,
            &mut corners,
            self.features.max_corners as i32,
            self.features.quality_level as f64,
            self.features.min_distance as f64,
            &mask,
            self.features.block_size as i32,
            false,
            0.04,
        )
        .map_err(convert)?;
        Ok(corners.iter().map(|p| (p.x, p.y)).collect())
    }

    fn track(
        &mut self,
        previous: &GrayImage,
        next: &GrayImage,
        points: &[(f32, f32)],
    ) -> VisionResult<Vec<FlowPoint>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let convert = |e: opencv::Error| VisionError::SourceRead(format!("optical flow: {e}"));
        let previous = gray_to_mat(previous).map_err(convert)?;
        let next = gray_to_mat(next).map_err(convert)?;
        let seeds: Vector<Point2f> = points.iter().map(|&(x, y)| Point2f::new(x, y)).collect();
        let mut moved = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut error = Vector::<f32>::new();
        let criteria = TermCriteria::new(
            core::TermCriteria_Type::COUNT as i32 | core::TermCriteria_Type::EPS as i32,
            self.flow.max_iterations as i32,
            self.flow.epsilon as f64,
        )
        .map_err(convert)?;
        let window = self.flow.window as i32;

        video::calc_optical_flow_pyr_lk(
            &previous,
            &next,
            &seeds,
            &mut moved,
            &mut status,
            &mut error,
            Size::new(window, window),
            self.flow.max_level as i32,
            criteria,
            0,
            self.flow.min_eigen_threshold as f64,
        )
        .map_err(convert)?;

        Ok(moved
            .iter()
            .zip(status.iter())
            .map(|(p, found)| FlowPoint {
                position: (p.x, p.y),
                found: found == 1,
            })
            .collect())
    }
}

/// Reads `width=` and `height=` from the `[net]` section of a darknet cfg.
fn network_input_size(config: &Path) -> VisionResult<(u32, u32)> {
    let contents = std::fs::read_to_string(config)?;
    let mut in_net = false;
    let (mut width, mut height) = (DEFAULT_NETWORK_SIDE, DEFAULT_NETWORK_SIDE);
    for line in contents.lines().map(str::trim) {
        if line.starts_with('[') {
            if in_net {
                break;
            }
            in_net = line == "[net]";
            continue;
        }
        if !in_net {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "width" => width = value.trim().parse().unwrap_or(width),
                "height" => height = value.trim().parse().unwrap_or(height),
                _ => {}
            }
        }
    }
    Ok((width, height))
}

/// Darknet inference through OpenCV's DNN module.
pub struct DarknetBackend {
    net: dnn::Net,
    input_size: (u32, u32),
    output_names: Vector<String>,
    threshold: f32,
    nms_threshold: f32,
}

impl DarknetBackend {
    pub fn load(paths: &ModelPaths, threshold: f32, nms_threshold: f32) -> VisionResult<Box<dyn DetectionBackend>> {
        let input_size = network_input_size(&paths.config)?;
        let net = dnn::read_net_from_darknet(&paths.config.to_string_lossy(), &paths.weights.to_string_lossy())
            .map_err(|e| VisionError::ModelLoad(e.to_string()))?;
        let output_names = net
            .get_unconnected_out_layers_names()
            .map_err(|e| VisionError::ModelLoad(e.to_string()))?;
        info!(width = input_size.0, height = input_size.1, "Darknet network ready");
        Ok(Box::new(Self {
            net,
            input_size,
            output_names,
            threshold,
            nms_threshold,
        }))
    }

    fn run(&mut self, input: &RgbImage) -> opencv::Result<Vec<RawDetection>> {
        let (net_w, net_h) = self.input_size;
        let rgb = rgb_mat(input)?;
        let blob = dnn::blob_from_image(
            &rgb,
            1.0 / 255.0,
            Size::new(net_w as i32, net_h as i32),
            Scalar::default(),
            false,
            false,
            core::CV_32F,
        )?;
        self.net.set_input(&blob, "", 1.0, Scalar::default())?;
        let mut outputs: Vector<Mat> = Vector::new();
        self.net.forward(&mut outputs, &self.output_names)?;

        let mut candidates = Vec::new();
        let mut boxes: Vector<Rect> = Vector::new();
        let mut scores: Vector<f32> = Vector::new();
        for output in outputs.iter() {
            for row in 0..output.rows() {
                let values = output.at_row::<f32>(row)?;
                if values.len() <= 5 {
                    continue;
                }
                let Some((class_id, &confidence)) = values[5..]
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                else {
                    continue;
                };
                if confidence < self.threshold {
                    continue;
                }
                let raw = RawDetection {
                    class_id,
                    confidence,
                    center_x: values[0] * net_w as f32,
                    center_y: values[1] * net_h as f32,
                    width: values[2] * net_w as f32,
                    height: values[3] * net_h as f32,
                };
                boxes.push(Rect::new(
                    (raw.center_x - raw.width / 2.0) as i32,
                    (raw.center_y - raw.height / 2.0) as i32,
                    raw.width as i32,
                    raw.height as i32,
                ));
                scores.push(confidence);
                candidates.push(raw);
            }
        }

        let mut keep: Vector<i32> = Vector::new();
        dnn::nms_boxes(&boxes, &scores, self.threshold, self.nms_threshold, &mut keep, 1.0, 0)?;
        Ok(keep
            .iter()
            .filter_map(|i| candidates.get(i as usize).cloned())
            .collect())
    }
}

impl DetectionBackend for DarknetBackend {
    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn infer(&mut self, input: &RgbImage) -> VisionResult<Vec<RawDetection>> {
        self.run(input).map_err(|e| VisionError::ModelLoad(format!("inference: {e}")))
    }
}

/// MJPG-encoded AVI clips.
pub struct AviClipWriter {
    fps: f64,
}

impl AviClipWriter {
    pub fn new(fps: u32) -> Self {
        Self { fps: fps.max(1) as f64 }
    }
}

impl ClipWriter for AviClipWriter {
    fn extension(&self) -> &str {
        "avi"
    }

    fn write(&mut self, frames: &[RgbImage], width: u32, height: u32, destination: &Path) -> VisionResult<()> {
        let fail = |e: opencv::Error| VisionError::clip_write(destination, e.to_string());

        let fourcc = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G').map_err(fail)?;
        let mut writer = videoio::VideoWriter::new(
            &destination.to_string_lossy(),
            fourcc,
            self.fps,
            Size::new(width as i32, height as i32),
            true,
        )
        .map_err(fail)?;
        if !writer.is_opened().map_err(fail)? {
            return Err(VisionError::clip_write(destination, "video writer did not open"));
        }

        for frame in frames {
            let frame = if frame.dimensions() == (width, height) {
                rgb_to_bgr_mat(frame)
            } else {
                let resized = image::imageops::resize(frame, width, height, image::imageops::FilterType::Triangle);
                rgb_to_bgr_mat(&resized)
            }
            .map_err(fail)?;
            writer.write(&frame).map_err(fail)?;
        }
        writer.release().map_err(fail)
    }
}

/// The "Output" and "Mask" windows, with `q` to quit and `p` to pause.
pub struct HighGuiSink;

impl HighGuiSink {
    pub fn new() -> VisionResult<Self> {
        for name in [OUTPUT_WINDOW, MASK_WINDOW] {
            highgui::named_window(name, highgui::WINDOW_AUTOSIZE)
                .map_err(|e| VisionError::BackendUnavailable(e.to_string()))?;
        }
        Ok(Self)
    }

    fn key_command(delay_ms: i32) -> VisionResult<Option<ControlCommand>> {
        let key = highgui::wait_key(delay_ms).map_err(|e| VisionError::BackendUnavailable(e.to_string()))?;
        Ok(match u8::try_from(key & 0xff).map(char::from) {
            Ok('q') => Some(ControlCommand::Quit),
            Ok('p') => Some(ControlCommand::TogglePause),
            _ => None,
        })
    }
}

impl DisplaySink for HighGuiSink {
    fn present(&mut self, report: &FrameReport) -> VisionResult<Option<ControlCommand>> {
        let show = |e: opencv::Error| VisionError::BackendUnavailable(e.to_string());
        highgui::imshow(OUTPUT_WINDOW, &rgb_to_bgr_mat(&report.composite).map_err(show)?).map_err(show)?;
        highgui::imshow(MASK_WINDOW, &gray_to_mat(report.mask.as_gray()).map_err(show)?).map_err(show)?;
        Self::key_command(1)
    }

    fn poll_command(&mut self) -> VisionResult<Option<ControlCommand>> {
        Self::key_command(30)
    }
}

impl Drop for HighGuiSink {
    fn drop(&mut self) {
        let _ = highgui::destroy_all_windows();
    }
}
