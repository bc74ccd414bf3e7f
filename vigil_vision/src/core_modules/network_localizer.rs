// THEORY:
// The `network_localizer` wraps a trained object-detection network behind the
// `Localizer` strategy interface.
//
// Key architectural principles:
// 1.  **Explicit Model State**: Weights are loaded exactly once, at startup, into a
//     `ModelContext`. The context is created by the caller and handed to the
//     localizer; it is never a global. A failure to load (missing config, weights
//     or class names) surfaces as an error before the first frame is processed.
// 2.  **Backend Seam**: Inference itself lives behind `DetectionBackend`. The
//     backend only ever sees images at its own input resolution and color order
//     and reports boxes in its own pixel space; this module owns every coordinate
//     conversion back to the source frame.
// 3.  **Absorbed Runtime Failures**: A backend error on a single frame is logged
//     and treated as "no detections". Only startup failures are fatal.

use crate::core_modules::canvas::{LabelFont, draw_box, draw_label};
use crate::core_modules::frame::{ForegroundMask, Frame};
use crate::core_modules::localizer::{BoundingBox, Detection, Localization, Localizer};
use crate::error::{VisionError, VisionResult};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Channel order a backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOrder {
    Rgb,
    Bgr,
}

/// A raw network output: darknet-style center box in network-input pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub center_x: f32,
    pub center_y: f32,
    pub width: f32,
    pub height: f32,
}

/// The inference engine behind the network localizer.
pub trait DetectionBackend {
    /// Network input resolution as (width, height).
    fn input_size(&self) -> (u32, u32);

    fn color_order(&self) -> ColorOrder {
        ColorOrder::Rgb
    }

    /// Runs inference on an image already resized to `input_size` and converted
    /// to `color_order`.
    fn infer(&mut self, input: &RgbImage) -> VisionResult<Vec<RawDetection>>;
}

/// Locations of the darknet model artifacts.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub config: PathBuf,
    pub data: PathBuf,
    pub weights: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            config: PathBuf::from("./darknet_cfg/yolov4-tiny.cfg"),
            data: PathBuf::from("./darknet_cfg/coco.data"),
            weights: PathBuf::from("./darknet_cfg/yolov4-tiny.weights"),
        }
    }
}

/// Process-lifetime model state: the backend plus everything needed to label
/// and draw its output.
pub struct ModelContext {
    backend: Box<dyn DetectionBackend>,
    class_names: Vec<String>,
    class_colors: Vec<Rgb<u8>>,
}

impl ModelContext {
    /// Validates the artifacts, reads the class names and builds the backend.
    pub fn load<F>(paths: &ModelPaths, build_backend: F) -> VisionResult<Self>
    where
        F: FnOnce(&ModelPaths) -> VisionResult<Box<dyn DetectionBackend>>,
    {
        for artifact in [&paths.config, &paths.data, &paths.weights] {
            if !artifact.is_file() {
                return Err(VisionError::ModelArtifactMissing(artifact.clone()));
            }
        }
        let names_path = names_path_from_data(&paths.data)?;
        let class_names = read_class_names(&names_path)?;
        let backend = build_backend(paths)?;
        info!(
            classes = class_names.len(),
            config = %paths.config.display(),
            "detection model loaded"
        );
        Ok(Self::with_backend(backend, class_names))
    }

    /// Builds a context around an already constructed backend.
    pub fn with_backend(backend: Box<dyn DetectionBackend>, class_names: Vec<String>) -> Self {
        let mut rng = StdRng::seed_from_u64(class_names.len() as u64);
        let class_colors = (0..class_names.len().max(1))
            .map(|_| Rgb([rng.gen_range(0..=255), rng.gen_range(0..=255), rng.gen_range(0..=255)]))
            .collect();
        Self {
            backend,
            class_names,
            class_colors,
        }
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn label(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{class_id}"))
    }

    fn color(&self, class_id: usize) -> Rgb<u8> {
        self.class_colors[class_id % self.class_colors.len()]
    }
}

/// Reads the `names` entry of a darknet `.data` file. A relative names path that
/// does not exist from the working directory is retried next to the data file.
pub fn names_path_from_data(data: &Path) -> VisionResult<PathBuf> {
    let contents = std::fs::read_to_string(data)?;
    let names = contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "names")
        .map(|(_, value)| PathBuf::from(value.trim()))
        .ok_or_else(|| {
            VisionError::ModelLoad(format!("no 'names' entry in {}", data.display()))
        })?;

    if names.is_file() || names.is_absolute() {
        return Ok(names);
    }
    let beside = data.parent().map(|dir| dir.join(&names));
    match beside {
        Some(path) if path.is_file() => Ok(path),
        _ => Err(VisionError::ModelArtifactMissing(names)),
    }
}

fn read_class_names(path: &Path) -> VisionResult<Vec<String>> {
    if !path.is_file() {
        return Err(VisionError::ModelArtifactMissing(path.to_path_buf()));
    }
    let names: Vec<String> = std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();
    if names.is_empty() {
        return Err(VisionError::ModelLoad(format!("{} lists no classes", path.display())));
    }
    Ok(names)
}

/// Maps a raw network box back onto a `frame_size` image, by the ratio of the
/// network input size to the frame size.
pub fn to_frame_coordinates(raw: &RawDetection, network: (u32, u32), frame: (u32, u32)) -> BoundingBox {
    let (net_w, net_h) = (network.0.max(1) as f32, network.1.max(1) as f32);
    let (img_w, img_h) = (frame.0 as f32, frame.1 as f32);

    let center_x = (raw.center_x / net_w * img_w) as i32;
    let center_y = (raw.center_y / net_h * img_h) as i32;
    let width = (raw.width / net_w * img_w).max(0.0) as u32;
    let height = (raw.height / net_h * img_h).max(0.0) as u32;

    BoundingBox {
        x: center_x - (width / 2) as i32,
        y: center_y - (height / 2) as i32,
        width,
        height,
    }
}

pub struct NetworkLocalizer {
    context: ModelContext,
    font: Option<LabelFont>,
}

impl NetworkLocalizer {
    pub fn new(context: ModelContext, font: Option<LabelFont>) -> Self {
        Self { context, font }
    }

    fn prepare_input(&self, frame: &Frame) -> RgbImage {
        let (net_w, net_h) = self.context.backend.input_size();
        let mut input = image::imageops::resize(&frame.image, net_w, net_h, FilterType::Triangle);
        if self.context.backend.color_order() == ColorOrder::Bgr {
            for pixel in input.pixels_mut() {
                pixel.0.swap(0, 2);
            }
        }
        input
    }
}

impl Localizer for NetworkLocalizer {
    fn localize(&mut self, frame: &Frame, _mask: &ForegroundMask) -> Localization {
        let input = self.prepare_input(frame);
        let network = self.context.backend.input_size();

        let raw = match self.context.backend.infer(&input) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(frame = frame.index, error = %e, "inference failed; treating frame as empty");
                Vec::new()
            }
        };

        let mut annotated = frame.image.clone();
        let mut detections = Vec::with_capacity(raw.len());
        for r in &raw {
            let bounding_box = to_frame_coordinates(r, network, frame.dimensions());
            let detection = Detection::new(self.context.label(r.class_id), r.confidence, bounding_box);
            let color = self.context.color(r.class_id);
            draw_box(&mut annotated, &detection.bounding_box, color);
            if let Some(font) = &self.font {
                let text = format!("{} [{:.2}]", detection.label, detection.confidence * 100.0);
                draw_label(&mut annotated, font, &detection.bounding_box, &text, color);
            }
            detections.push(detection);
        }

        Localization {
            annotated,
            detections,
            refined_mask: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct ScriptedBackend {
        size: (u32, u32),
        order: ColorOrder,
        output: Vec<RawDetection>,
        seen: Rc<RefCell<Vec<RgbImage>>>,
    }

    impl DetectionBackend for ScriptedBackend {
        fn input_size(&self) -> (u32, u32) {
            self.size
        }

        fn color_order(&self) -> ColorOrder {
            self.order
        }

        fn infer(&mut self, input: &RgbImage) -> VisionResult<Vec<RawDetection>> {
            self.seen.borrow_mut().push(input.clone());
            Ok(self.output.clone())
        }
    }

    struct FailingBackend;

    impl DetectionBackend for FailingBackend {
        fn input_size(&self) -> (u32, u32) {
            (32, 32)
        }

        fn infer(&mut self, _input: &RgbImage) -> VisionResult<Vec<RawDetection>> {
            Err(VisionError::ModelLoad("boom".into()))
        }
    }

    fn raw(class_id: usize, cx: f32, cy: f32, w: f32, h: f32) -> RawDetection {
        RawDetection {
            class_id,
            confidence: 0.8,
            center_x: cx,
            center_y: cy,
            width: w,
            height: h,
        }
    }

    #[test]
    fn boxes_scale_back_to_the_frame() {
        let bbox = to_frame_coordinates(&raw(0, 208.0, 104.0, 104.0, 52.0), (416, 416), (832, 416));
        assert_eq!(bbox, BoundingBox { x: 312, y: 78, width: 208, height: 52 });
    }

    #[test]
    fn localize_resizes_swaps_channels_and_labels() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let backend = ScriptedBackend {
            size: (16, 8),
            order: ColorOrder::Bgr,
            output: vec![raw(1, 8.0, 4.0, 4.0, 2.0), raw(7, 2.0, 2.0, 2.0, 2.0)],
            seen: seen.clone(),
        };
        let context = ModelContext::with_backend(
            Box::new(backend),
            vec!["bicycle".into(), "person".into()],
        );
        let mut localizer = NetworkLocalizer::new(context, None);
        let frame = Frame::new(0, RgbImage::from_pixel(64, 32, Rgb([200, 20, 5])));

        let result = localizer.localize(&frame, &ForegroundMask::empty(64, 32));

        let inputs = seen.borrow();
        assert_eq!(inputs[0].dimensions(), (16, 8));
        assert_eq!(*inputs[0].get_pixel(3, 3), Rgb([5, 20, 200]));
        assert_eq!(result.detections.len(), 2);
        assert!(result.detections[0].is_person());
        assert_eq!(
            result.detections[0].bounding_box,
            BoundingBox { x: 24, y: 12, width: 16, height: 8 }
        );
        assert_eq!(result.detections[1].label, "class7");
        assert!(result.refined_mask.is_none());
        assert_eq!(*frame.image.get_pixel(24, 12), Rgb([200, 20, 5]));
    }

    #[test]
    fn inference_failure_is_absorbed() {
        let context = ModelContext::with_backend(Box::new(FailingBackend), vec!["person".into()]);
        let mut localizer = NetworkLocalizer::new(context, None);
        let frame = Frame::new(0, RgbImage::new(10, 10));
        let result = localizer.localize(&frame, &ForegroundMask::empty(10, 10));
        assert!(result.detections.is_empty());
        assert_eq!(result.annotated, frame.image);
    }

    #[test]
    fn missing_weights_fail_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths {
            config: dir.path().join("yolo.cfg"),
            data: dir.path().join("coco.data"),
            weights: dir.path().join("yolo.weights"),
        };
        std::fs::write(&paths.config, "[net]").unwrap();
        std::fs::write(&paths.data, "names = coco.names").unwrap();

        let result = ModelContext::load(&paths, |_| -> VisionResult<Box<dyn DetectionBackend>> {
            unreachable!("backend must not be built without weights")
        });
        assert!(matches!(result, Err(VisionError::ModelArtifactMissing(p)) if p == paths.weights));
    }

    #[test]
    fn load_reads_names_next_to_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths {
            config: dir.path().join("yolo.cfg"),
            data: dir.path().join("coco.data"),
            weights: dir.path().join("yolo.weights"),
        };
        std::fs::write(&paths.config, "[net]").unwrap();
        std::fs::write(&paths.weights, [0u8; 4]).unwrap();
        std::fs::write(&paths.data, "classes = 2\n# comment\nnames = coco.names\nbackup = backup/\n").unwrap();
        std::fs::write(dir.path().join("coco.names"), "person\nbicycle\n\n").unwrap();

        let context = ModelContext::load(&paths, |_| Ok(Box::new(FailingBackend) as Box<dyn DetectionBackend>))
            .unwrap();
        assert_eq!(context.class_names(), &["person".to_string(), "bicycle".to_string()]);
    }

    #[test]
    fn data_file_without_names_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("coco.data");
        std::fs::write(&data, "classes = 80\n").unwrap();
        assert!(matches!(names_path_from_data(&data), Err(VisionError::ModelLoad(_))));
    }
}
