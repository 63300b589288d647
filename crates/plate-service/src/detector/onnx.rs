/// YOLO object detector backed by ONNX Runtime
use super::{retain_confident, Detector};
use anyhow::{Context, Result};
use common::plate_tasks::{BoundingBox, Detection};
use image::DynamicImage;
use ndarray::{Array, IxDyn};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Instant;

/// Output tensor names tried in order; YOLO exports differ between tools
const OUTPUT_NAMES: &[&str] = &["output0", "output", "boxes"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Path to the ONNX model file
    pub model_path: String,

    /// Model input size (width and height)
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// IoU threshold for NMS
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Maximum number of detections returned per call
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,

    /// Candidates scoring below this never reach NMS
    #[serde(default = "default_min_candidate_score")]
    pub min_candidate_score: f32,

    /// Suppress overlapping boxes across classes instead of per class
    #[serde(default)]
    pub class_agnostic_nms: bool,

    /// Execution provider preference (CPU, CUDA, TensorRT)
    #[serde(default = "default_execution_provider")]
    pub execution_provider: String,

    /// GPU device ID
    #[serde(default)]
    pub device_id: i32,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    #[serde(default = "default_inter_threads")]
    pub inter_threads: usize,
}

fn default_input_size() -> u32 {
    640
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_max_detections() -> usize {
    100
}

fn default_min_candidate_score() -> f32 {
    0.001
}

fn default_execution_provider() -> String {
    "CPU".to_string()
}

fn default_intra_threads() -> usize {
    4
}

fn default_inter_threads() -> usize {
    1
}

impl DetectorConfig {
    /// Settings for the plate localization pass
    pub fn plate(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    /// Settings for the character pass: IoU 0.5, at most 50 glyphs
    pub fn character(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            iou_threshold: 0.5,
            max_detections: 50,
            ..Self::default()
        }
    }

    pub fn with_execution_provider(mut self, provider: impl Into<String>, device_id: i32) -> Self {
        self.execution_provider = provider.into();
        self.device_id = device_id;
        self
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "models/plate_detector.onnx".to_string(),
            input_size: default_input_size(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
            min_candidate_score: default_min_candidate_score(),
            class_agnostic_nms: false,
            execution_provider: default_execution_provider(),
            device_id: 0,
            intra_threads: default_intra_threads(),
            inter_threads: default_inter_threads(),
        }
    }
}

/// YOLO detector with one ONNX session.
///
/// The session is behind a mutex, so inference on one detector is
/// serialized while the plate and character detectors run independently.
pub struct OnnxDetector {
    id: String,
    config: DetectorConfig,
    session: Mutex<Session>,
    execution_provider: String,
}

impl OnnxDetector {
    /// Load the model, falling back TensorRT -> CUDA -> CPU as needed
    pub fn load(id: impl Into<String>, config: DetectorConfig) -> Result<Self> {
        let id = id.into();
        let (session, execution_provider) = create_session(&config)?;

        tracing::info!(
            detector = %id,
            model = %config.model_path,
            provider = %execution_provider,
            device = config.device_id,
            input_size = config.input_size,
            "Initialized detector"
        );

        Ok(Self {
            id,
            config,
            session: Mutex::new(session),
            execution_provider,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Resize to the model input and convert to normalized NCHW
    fn preprocess(&self, img: &DynamicImage) -> Array<f32, IxDyn> {
        let size = self.config.input_size;
        let resized = img.resize_exact(size, size, image::imageops::FilterType::Triangle);
        let rgb_img = resized.to_rgb8();

        let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));

        for (x, y, pixel) in rgb_img.enumerate_pixels() {
            for channel in 0..3 {
                input[[0, channel, y as usize, x as usize]] = pixel[channel] as f32 / 255.0;
            }
        }

        input
    }

    fn infer(&self, input: Array<f32, IxDyn>) -> Result<Array<f32, IxDyn>> {
        let input_tensor = Value::from_array(input)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to lock {} session: {}", self.id, e))?;
        let outputs = session.run(ort::inputs![input_tensor])?;

        let output_value = OUTPUT_NAMES
            .iter()
            .find_map(|name| outputs.get(*name))
            .with_context(|| {
                format!(
                    "No detection output tensor found (tried: {})",
                    OUTPUT_NAMES.join(", ")
                )
            })?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;

        let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        Ok(Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?)
    }
}

impl Detector for OnnxDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn detect(&self, image: &DynamicImage, threshold: Option<f32>) -> Result<Vec<Detection>> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let input = self.preprocess(image);

        let inference_start = Instant::now();
        let output = self.infer(input)?;
        telemetry::metrics::PLATE_SERVICE_INFERENCE_TIME
            .with_label_values(&[self.id.as_str(), self.execution_provider.as_str()])
            .observe(inference_start.elapsed().as_secs_f64());

        let candidates = decode_predictions(&output, &self.config, width, height)?;
        let mut detections = non_max_suppression(
            candidates,
            self.config.iou_threshold,
            self.config.class_agnostic_nms,
        );
        retain_confident(&mut detections, threshold);
        detections.truncate(self.config.max_detections);

        Ok(detections)
    }

    fn execution_provider(&self) -> String {
        self.execution_provider.clone()
    }

    fn model_path(&self) -> Option<&str> {
        Some(&self.config.model_path)
    }

    fn health_check(&self) -> bool {
        !self.session.is_poisoned()
    }
}

/// Decode a YOLOv8-style head into image-space candidates.
///
/// Accepts `[1, 4 + classes, predictions]` and the transposed
/// `[1, predictions, 4 + classes]` layout. Boxes are `cx, cy, w, h` in
/// model input pixels and are scaled back to `width` x `height`.
pub fn decode_predictions(
    output: &Array<f32, IxDyn>,
    config: &DetectorConfig,
    width: u32,
    height: u32,
) -> Result<Vec<Detection>> {
    let shape = output.shape();
    anyhow::ensure!(
        shape.len() == 3 && shape[0] == 1,
        "unexpected detector output shape {:?}",
        shape
    );

    let transposed = shape[1] > shape[2];
    let (attributes, num_predictions) = if transposed {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    anyhow::ensure!(
        attributes > 4,
        "detector output has no class scores (shape {:?})",
        shape
    );
    let num_classes = attributes - 4;

    let at = |attribute: usize, prediction: usize| {
        if transposed {
            output[[0, prediction, attribute]]
        } else {
            output[[0, attribute, prediction]]
        }
    };

    let scale_x = width as f32 / config.input_size as f32;
    let scale_y = height as f32 / config.input_size as f32;

    let mut candidates = Vec::new();

    for i in 0..num_predictions {
        let mut best_score = 0.0f32;
        let mut best_class = 0;

        for class_idx in 0..num_classes {
            let score = at(4 + class_idx, i);
            if score > best_score {
                best_score = score;
                best_class = class_idx;
            }
        }

        if best_score < config.min_candidate_score {
            continue;
        }

        let cx = at(0, i);
        let cy = at(1, i);
        let w = at(2, i);
        let h = at(3, i);

        let raw = BoundingBox::new(
            ((cx - w / 2.0) * scale_x) as i32,
            ((cy - h / 2.0) * scale_y) as i32,
            ((cx + w / 2.0) * scale_x) as i32,
            ((cy + h / 2.0) * scale_y) as i32,
        );
        // boxes may spill past the frame; nothing left inside means no detection
        let Some(bbox) = raw.clamp_to(width, height) else {
            continue;
        };

        candidates.push(Detection::new(bbox, best_class, best_score));
    }

    Ok(candidates)
}

/// Greedy NMS; survivors come back sorted by confidence, highest first
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    class_agnostic: bool,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut suppressed = vec![false; candidates.len()];
    let mut keep = Vec::new();

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        let current = &candidates[i];

        for j in (i + 1)..candidates.len() {
            if suppressed[j] {
                continue;
            }
            let other = &candidates[j];
            if (class_agnostic || other.class_id == current.class_id)
                && current.bbox.iou(&other.bbox) >= iou_threshold
            {
                suppressed[j] = true;
            }
        }

        keep.push(current.clone());
    }

    keep
}

fn build_session(config: &DetectorConfig, providers: Vec<ExecutionProviderDispatch>) -> Result<Session> {
    let mut builder = Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(config.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(config.inter_threads)
        .context("Failed to set inter threads")?;

    if !providers.is_empty() {
        builder = builder
            .with_execution_providers(providers)
            .context("Failed to set execution providers")?;
    }

    builder
        .commit_from_file(&config.model_path)
        .with_context(|| format!("Failed to load model from {}", config.model_path))
}

/// Create the ONNX session with execution provider fallback
fn create_session(config: &DetectorConfig) -> Result<(Session, String)> {
    match config.execution_provider.to_uppercase().as_str() {
        "TENSORRT" => {
            tracing::info!("Attempting TensorRT for {}", config.model_path);
            let providers = vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ];
            match build_session(config, providers) {
                Ok(session) => Ok((session, "TensorRT".to_string())),
                Err(e) => {
                    tracing::warn!("TensorRT failed, trying CUDA: {:#}", e);
                    try_cuda(config)
                }
            }
        }
        "CUDA" => try_cuda(config),
        _ => try_cpu(config),
    }
}

fn try_cuda(config: &DetectorConfig) -> Result<(Session, String)> {
    tracing::info!("Attempting CUDA for {}", config.model_path);
    let providers = vec![
        CUDAExecutionProvider::default()
            .with_device_id(config.device_id)
            .build(),
        CPUExecutionProvider::default().build(),
    ];
    match build_session(config, providers) {
        Ok(session) => Ok((session, "CUDA".to_string())),
        Err(e) => {
            tracing::warn!("CUDA failed, using CPU: {:#}", e);
            try_cpu(config)
        }
    }
}

fn try_cpu(config: &DetectorConfig) -> Result<(Session, String)> {
    tracing::info!("Using CPU for {}", config.model_path);
    let session = build_session(config, Vec::new())?;
    Ok((session, "CPU".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: i32, y1: i32, x2: i32, y2: i32, class_id: usize, confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), class_id, confidence)
    }

    #[test]
    fn test_config_defaults() {
        let plate = DetectorConfig::plate("models/plate.onnx");
        assert_eq!(plate.model_path, "models/plate.onnx");
        assert_eq!(plate.input_size, 640);
        assert_eq!(plate.iou_threshold, 0.45);
        assert_eq!(plate.max_detections, 100);
        assert_eq!(plate.execution_provider, "CPU");

        let character = DetectorConfig::character("models/char.onnx");
        assert_eq!(character.iou_threshold, 0.5);
        assert_eq!(character.max_detections, 50);
        assert!(!character.class_agnostic_nms);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: DetectorConfig = serde_json::from_value(serde_json::json!({
            "model_path": "weights.onnx",
            "execution_provider": "CUDA",
            "device_id": 1
        }))
        .unwrap();

        assert_eq!(config.model_path, "weights.onnx");
        assert_eq!(config.execution_provider, "CUDA");
        assert_eq!(config.device_id, 1);
        assert_eq!(config.input_size, 640);
        assert_eq!(config.intra_threads, 4);
    }

    #[test]
    fn test_load_missing_model_fails() {
        let config = DetectorConfig::plate("models/does_not_exist.onnx");
        assert!(OnnxDetector::load("plate", config).is_err());
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let candidates = vec![
            det(10, 10, 110, 40, 0, 0.8),
            det(12, 11, 112, 41, 0, 0.9),
            det(200, 200, 300, 230, 0, 0.85),
        ];

        let kept = non_max_suppression(candidates, 0.45, false);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.85);
    }

    #[test]
    fn test_nms_per_class_keeps_different_classes() {
        let candidates = vec![det(0, 0, 10, 20, 3, 0.9), det(0, 0, 10, 20, 8, 0.7)];

        assert_eq!(non_max_suppression(candidates.clone(), 0.5, false).len(), 2);
        assert_eq!(non_max_suppression(candidates, 0.5, true).len(), 1);
    }

    #[test]
    fn test_decode_scales_to_original_image() {
        // [1, 4 + 2 classes, 8 predictions]
        let config = DetectorConfig {
            input_size: 100,
            ..DetectorConfig::default()
        };
        let mut output = Array::zeros(IxDyn(&[1, 6, 8]));
        // prediction 0: centered box, class 1 wins
        output[[0, 0, 0]] = 50.0;
        output[[0, 1, 0]] = 50.0;
        output[[0, 2, 0]] = 20.0;
        output[[0, 3, 0]] = 10.0;
        output[[0, 4, 0]] = 0.2;
        output[[0, 5, 0]] = 0.9;
        // prediction 1: box without any class score
        output[[0, 2, 1]] = 5.0;
        output[[0, 3, 1]] = 5.0;

        let decoded = decode_predictions(&output, &config, 200, 300).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].class_id, 1);
        assert!((decoded[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(decoded[0].bbox, BoundingBox::new(80, 135, 120, 165));
    }

    #[test]
    fn test_decode_transposed_layout() {
        let config = DetectorConfig {
            input_size: 10,
            ..DetectorConfig::default()
        };
        // [1, 6 predictions, 4 + 1 class]
        let mut output = Array::zeros(IxDyn(&[1, 6, 5]));
        output[[0, 3, 0]] = 5.0;
        output[[0, 3, 1]] = 5.0;
        output[[0, 3, 2]] = 4.0;
        output[[0, 3, 3]] = 2.0;
        output[[0, 3, 4]] = 0.75;

        let decoded = decode_predictions(&output, &config, 10, 10).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].bbox, BoundingBox::new(3, 4, 7, 6));
    }

    #[test]
    fn test_decode_clamps_boxes_to_frame() {
        let config = DetectorConfig {
            input_size: 100,
            ..DetectorConfig::default()
        };
        // [1, 4 + 1 class, 8 predictions]
        let mut output = Array::zeros(IxDyn(&[1, 5, 8]));
        // prediction 0: centered near the bottom-left corner
        output[[0, 0, 0]] = 2.0;
        output[[0, 1, 0]] = 98.0;
        output[[0, 2, 0]] = 20.0;
        output[[0, 3, 0]] = 20.0;
        output[[0, 4, 0]] = 0.9;
        // prediction 1: entirely left of the frame
        output[[0, 0, 1]] = -50.0;
        output[[0, 1, 1]] = 50.0;
        output[[0, 2, 1]] = 20.0;
        output[[0, 3, 1]] = 20.0;
        output[[0, 4, 1]] = 0.8;

        let decoded = decode_predictions(&output, &config, 100, 100).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].bbox, BoundingBox::new(0, 88, 12, 100));
        assert!(decoded.iter().all(|d| d.bbox.x1 >= 0
            && d.bbox.y1 >= 0
            && d.bbox.x2 <= 100
            && d.bbox.y2 <= 100));
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let config = DetectorConfig::default();
        let output = Array::zeros(IxDyn(&[1, 4, 10]));
        assert!(decode_predictions(&output, &config, 10, 10).is_err());
    }
}
