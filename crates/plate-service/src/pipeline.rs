//! Detection-to-text orchestration for one image.
//!
//! `Received -> PlateDetected -> [per box: Cropped -> CharDetected ->
//! Grouped -> Assembled -> Annotated] -> Aggregated`. Boxes are independent:
//! a box that cannot be cropped, or whose character pass fails, is dropped
//! from the result while the others carry on. Only an undecodable image, a
//! failed plate pass, or an alphabet mismatch aborts the call.

use crate::alphabet::Alphabet;
use crate::annotate::Annotator;
use crate::artifacts::{crop_plate, encode_jpeg, ArtifactStore, DEFAULT_JPEG_QUALITY};
use crate::detector::{retain_confident, Detector};
use crate::error::PipelineError;
use crate::grouping::{group_characters, DEFAULT_ROW_THRESHOLD_FRACTION};
use common::plate_tasks::{
    BoundingBox, CharacterDetection, Detection, ImageResult, PipelineInfo, PlateResult,
};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics;
use tracing::{debug, info, warn};

pub const DEFAULT_PLATE_CONF_THRESHOLD: f32 = 0.5;
pub const DEFAULT_CHAR_CONF_THRESHOLD: f32 = 0.5;
pub const DEFAULT_CHAR_CROP_SIZE: u32 = 640;

/// Confidence cut-offs for one invocation; both inclusive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub plate: f32,
    pub character: f32,
}

impl Thresholds {
    pub fn new(plate: f32, character: f32) -> Self {
        Self { plate, character }
    }

    /// Replace the values a request supplied, keep the rest
    pub fn with_overrides(self, plate: Option<f32>, character: Option<f32>) -> Self {
        Self {
            plate: plate.unwrap_or(self.plate),
            character: character.unwrap_or(self.character),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, value) in [("plate", self.plate), ("character", self.character)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            plate: DEFAULT_PLATE_CONF_THRESHOLD,
            character: DEFAULT_CHAR_CONF_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default = "default_row_threshold_fraction")]
    pub row_threshold_fraction: f32,

    /// Square size plate crops are resized to before the character pass;
    /// `None` runs the character detector on the raw crop
    #[serde(default = "default_char_crop_size")]
    pub char_crop_size: Option<u32>,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_row_threshold_fraction() -> f32 {
    DEFAULT_ROW_THRESHOLD_FRACTION
}

fn default_char_crop_size() -> Option<u32> {
    Some(DEFAULT_CHAR_CROP_SIZE)
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            row_threshold_fraction: default_row_threshold_fraction(),
            char_crop_size: default_char_crop_size(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Why a plate box produced no PlateResult
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    DegenerateCrop,
    CharacterPassFailed,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DegenerateCrop => "degenerate_crop",
            SkipReason::CharacterPassFailed => "character_pass_failed",
        }
    }
}

enum PlateOutcome {
    Recognized(PlateResult),
    Skipped(SkipReason),
}

/// Per-invocation context threaded through the per-plate stages
struct Invocation<'a> {
    result_id: &'a str,
    thresholds: Thresholds,
    warnings: Vec<String>,
}

/// The plate-to-text pipeline.
///
/// Detectors, alphabet and store are shared read-only; every call owns its
/// intermediate values, so one instance serves concurrent callers.
pub struct PlatePipeline {
    plate_detector: Arc<dyn Detector>,
    char_detector: Arc<dyn Detector>,
    alphabet: Arc<Alphabet>,
    store: ArtifactStore,
    annotator: Annotator,
    config: PipelineConfig,
}

impl PlatePipeline {
    pub fn new(
        plate_detector: Arc<dyn Detector>,
        char_detector: Arc<dyn Detector>,
        alphabet: Arc<Alphabet>,
        store: ArtifactStore,
        annotator: Annotator,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.thresholds.validate()?;

        Ok(Self {
            plate_detector,
            char_detector,
            alphabet,
            store,
            annotator,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn default_thresholds(&self) -> Thresholds {
        self.config.thresholds
    }

    pub fn is_healthy(&self) -> bool {
        self.plate_detector.health_check() && self.char_detector.health_check()
    }

    pub fn info(&self) -> PipelineInfo {
        PipelineInfo {
            alphabet_version: self.alphabet.version().to_string(),
            alphabet_len: self.alphabet.len(),
            plate_detector: self.plate_detector.info(),
            char_detector: self.char_detector.info(),
            default_plate_conf_threshold: self.config.thresholds.plate,
            default_char_conf_threshold: self.config.thresholds.character,
            row_threshold_fraction: self.config.row_threshold_fraction,
            char_crop_size: self.config.char_crop_size,
        }
    }

    /// Decode `bytes` and recognize every plate in it.
    ///
    /// Blocking: runs both detectors and writes artifacts to disk.
    pub fn process(&self, bytes: &[u8], thresholds: Thresholds) -> Result<ImageResult, PipelineError> {
        let result = thresholds
            .validate()
            .and_then(|_| image::load_from_memory(bytes).map_err(PipelineError::from))
            .and_then(|image| self.process_image(&image, thresholds));

        let status = match &result {
            Ok(_) => "success",
            Err(e) if e.is_client_error() => "rejected",
            Err(_) => "failed",
        };
        metrics::PLATE_SERVICE_IMAGES_PROCESSED
            .with_label_values(&[status])
            .inc();

        if let Err(e) = &result {
            warn!(error = %e, status, "Image processing failed");
        }

        result
    }

    /// Recognize plates in an already decoded image
    pub fn process_image(
        &self,
        image: &DynamicImage,
        thresholds: Thresholds,
    ) -> Result<ImageResult, PipelineError> {
        let started = Instant::now();
        thresholds.validate()?;

        let result_id = new_result_id();
        let mut invocation = Invocation {
            result_id: &result_id,
            thresholds,
            warnings: Vec::new(),
        };

        // Confidence filtering happens here so indices follow detector output
        let plates = self
            .plate_detector
            .detect(image, None)
            .map_err(PipelineError::Inference)?;

        let mut detections = Vec::new();
        let mut drawn: Vec<(BoundingBox, f32)> = Vec::new();

        for (index, plate) in plates.iter().enumerate() {
            if plate.confidence < thresholds.plate {
                continue;
            }
            drawn.push((plate.bbox, plate.confidence));

            match self.process_plate(image, index, plate, &mut invocation)? {
                PlateOutcome::Recognized(result) => {
                    let outcome = if result.plate_string.is_recognized() {
                        "recognized"
                    } else {
                        "unknown"
                    };
                    metrics::PLATE_SERVICE_PLATES
                        .with_label_values(&[outcome])
                        .inc();
                    detections.push(result);
                }
                PlateOutcome::Skipped(reason) => {
                    metrics::PLATE_SERVICE_PLATES
                        .with_label_values(&["skipped"])
                        .inc();
                    debug!(
                        result_id = %result_id,
                        index,
                        reason = reason.as_str(),
                        "Plate skipped"
                    );
                }
            }
        }

        let annotated = self.annotator.annotate_plates(image, &drawn);
        let annotated_image_path = self.persist(
            &DynamicImage::ImageRgb8(annotated),
            &format!("annotated_{}.jpg", result_id),
            "annotated_image",
            &mut invocation.warnings,
        );

        let elapsed = started.elapsed();
        metrics::PLATE_SERVICE_PIPELINE_LATENCY.observe(elapsed.as_secs_f64());

        info!(
            result_id = %result_id,
            plates_detected = plates.len(),
            plates_reported = detections.len(),
            warnings = invocation.warnings.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Processed image"
        );

        Ok(ImageResult {
            result_id: result_id.clone(),
            annotated_image_path,
            image_width: image.width(),
            image_height: image.height(),
            detections,
            warnings: invocation.warnings,
            processing_time_ms: elapsed.as_millis() as u64,
        })
    }

    fn process_plate(
        &self,
        image: &DynamicImage,
        index: usize,
        plate: &Detection,
        invocation: &mut Invocation<'_>,
    ) -> Result<PlateOutcome, PipelineError> {
        let result_id = invocation.result_id;

        // Cropped
        let Some(crop) = crop_plate(image, &plate.bbox) else {
            warn!(
                result_id = %result_id,
                index,
                plate_box = ?plate.bbox,
                "Plate box has no area inside the image, skipping"
            );
            return Ok(PlateOutcome::Skipped(SkipReason::DegenerateCrop));
        };

        let plate_crop_path = self.persist(
            &crop.image,
            &format!("plate_{}_{}.jpg", result_id, index),
            "plate_crop",
            &mut invocation.warnings,
        );

        let char_input = match self.config.char_crop_size {
            Some(size) => crop.image.resize_exact(size, size, FilterType::Triangle),
            None => crop.image,
        };

        // CharDetected
        let threshold = invocation.thresholds.character;
        let mut raw = match self.char_detector.detect(&char_input, Some(threshold)) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    result_id = %result_id,
                    index,
                    error = %e,
                    "Character detection failed, skipping plate"
                );
                invocation
                    .warnings
                    .push(format!("plate {}: character detection failed: {:#}", index, e));
                return Ok(PlateOutcome::Skipped(SkipReason::CharacterPassFailed));
            }
        };
        retain_confident(&mut raw, Some(threshold));
        let characters: Vec<CharacterDetection> = raw.into_iter().map(Into::into).collect();

        // Grouped
        let ordered = group_characters(characters, self.config.row_threshold_fraction);

        // Assembled
        let plate_string = self.alphabet.assemble(&ordered)?;
        metrics::PLATE_SERVICE_CHARACTERS.inc_by(ordered.len() as u64);

        // Annotated
        let annotated = self
            .annotator
            .annotate_characters(&char_input, &ordered, &self.alphabet);
        let annotated_crop_path = self.persist(
            &DynamicImage::ImageRgb8(annotated),
            &format!("plate_annotated_{}_{}.jpg", result_id, index),
            "annotated_crop",
            &mut invocation.warnings,
        );

        debug!(
            result_id = %result_id,
            index,
            confidence = plate.confidence,
            characters = ordered.len(),
            plate_string = %plate_string,
            "Recognized plate"
        );

        Ok(PlateOutcome::Recognized(PlateResult {
            index,
            plate_box: crop.region,
            plate_crop_path,
            annotated_crop_path,
            plate_string,
            plate_confidence: plate.confidence,
            characters: ordered,
        }))
    }

    /// Encode and store an artifact; failures become warnings and the
    /// reference is returned regardless
    fn persist(
        &self,
        image: &DynamicImage,
        name: &str,
        kind: &'static str,
        warnings: &mut Vec<String>,
    ) -> String {
        let written = encode_jpeg(image, self.config.jpeg_quality)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.store.write(&bytes, name).map_err(|e| e.to_string()));

        match written {
            Ok(reference) => reference,
            Err(e) => {
                warn!(artifact = name, kind, error = %e, "Failed to write artifact");
                metrics::PLATE_SERVICE_ARTIFACT_FAILURES
                    .with_label_values(&[kind])
                    .inc();
                warnings.push(format!("{} {} not written: {}", kind, name, e));
                self.store.reference(name)
            }
        }
    }
}

/// First 8 hex characters of a v4 UUID
fn new_result_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ScriptedDetector;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn plate(x1: i32, y1: i32, x2: i32, y2: i32, confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), 0, confidence)
    }

    fn glyph(x1: i32, y1: i32, x2: i32, y2: i32, class_id: usize, confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), class_id, confidence)
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::new_rgb8(width, height)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn pipeline(
        dir: &TempDir,
        plates: Vec<Detection>,
        chars: Vec<Detection>,
        config: PipelineConfig,
    ) -> PlatePipeline {
        PlatePipeline::new(
            Arc::new(ScriptedDetector::new("plate", plates)),
            Arc::new(ScriptedDetector::new("char", chars)),
            Arc::new(Alphabet::default()),
            ArtifactStore::new(dir.path(), "results").unwrap(),
            Annotator::without_labels(),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_thresholds_validate_range() {
        assert!(Thresholds::default().validate().is_ok());
        assert!(Thresholds::new(0.0, 1.0).validate().is_ok());
        assert!(Thresholds::new(-0.1, 0.5).validate().is_err());
        assert!(Thresholds::new(0.5, 1.01).validate().is_err());
        assert!(Thresholds::new(f32::NAN, 0.5).validate().is_err());
    }

    #[test]
    fn test_threshold_overrides() {
        let thresholds = Thresholds::default().with_overrides(Some(0.7), None);
        assert_eq!(thresholds, Thresholds::new(0.7, 0.5));
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.thresholds, Thresholds::default());
        assert_eq!(config.row_threshold_fraction, 0.15);
        assert_eq!(config.char_crop_size, Some(640));
        assert_eq!(config.jpeg_quality, 90);
    }

    #[test]
    fn test_invalid_default_thresholds_rejected() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            thresholds: Thresholds::new(2.0, 0.5),
            ..PipelineConfig::default()
        };
        let result = PlatePipeline::new(
            Arc::new(ScriptedDetector::new("plate", vec![])),
            Arc::new(ScriptedDetector::new("char", vec![])),
            Arc::new(Alphabet::default()),
            ArtifactStore::new(dir.path(), "results").unwrap(),
            Annotator::without_labels(),
            config,
        );
        assert!(matches!(result, Err(PipelineError::InvalidThreshold { .. })));
    }

    #[test]
    fn test_artifact_names_share_result_id() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            vec![plate(10, 10, 60, 30, 0.9)],
            vec![glyph(10, 10, 20, 20, 1, 0.9)],
            PipelineConfig::default(),
        );

        let result = pipeline.process(&png_bytes(100, 50), Thresholds::default()).unwrap();
        let rid = &result.result_id;
        assert_eq!(rid.len(), 8);
        assert!(rid.chars().all(|c| c.is_ascii_hexdigit()));

        assert_eq!(result.annotated_image_path, format!("results/annotated_{}.jpg", rid));
        let plate = &result.detections[0];
        assert_eq!(plate.plate_crop_path, format!("results/plate_{}_0.jpg", rid));
        assert_eq!(
            plate.annotated_crop_path,
            format!("results/plate_annotated_{}_0.jpg", rid)
        );
        assert!(dir.path().join(format!("plate_{}_0.jpg", rid)).exists());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_crop_resized_before_character_pass() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            vec![plate(10, 10, 60, 30, 0.9)],
            vec![],
            PipelineConfig::default(),
        );

        let result = pipeline.process(&png_bytes(100, 50), Thresholds::default()).unwrap();
        let annotated = pipeline
            .store()
            .read(&result.detections[0].annotated_crop_path)
            .unwrap();
        let annotated = image::load_from_memory(&annotated).unwrap();
        assert_eq!((annotated.width(), annotated.height()), (640, 640));

        let raw = pipeline.store().read(&result.detections[0].plate_crop_path).unwrap();
        let raw = image::load_from_memory(&raw).unwrap();
        assert_eq!((raw.width(), raw.height()), (50, 20));
    }

    #[test]
    fn test_skipped_box_keeps_index_of_later_boxes() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            vec![
                plate(200, 10, 260, 30, 0.9),
                plate(10, 10, 60, 30, 0.3),
                plate(10, 10, 60, 30, 0.8),
            ],
            vec![],
            PipelineConfig::default(),
        );

        let result = pipeline.process(&png_bytes(100, 50), Thresholds::default()).unwrap();
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].index, 2);
        assert!(result.detections[0].plate_crop_path.ends_with("_2.jpg"));
    }

    #[test]
    fn test_plate_box_reported_clamped() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            vec![plate(-20, 30, 80, 70, 0.9)],
            vec![],
            PipelineConfig::default(),
        );

        let result = pipeline.process(&png_bytes(100, 50), Thresholds::default()).unwrap();
        assert_eq!(result.detections[0].plate_box, BoundingBox::new(0, 30, 80, 50));
    }

    #[test]
    fn test_character_pass_failure_skips_only_that_plate() {
        struct FailingOnce(ScriptedDetector, std::sync::atomic::AtomicBool);

        impl Detector for FailingOnce {
            fn id(&self) -> &str {
                "char"
            }

            fn detect(
                &self,
                image: &DynamicImage,
                threshold: Option<f32>,
            ) -> anyhow::Result<Vec<Detection>> {
                if !self.1.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    anyhow::bail!("session poisoned");
                }
                self.0.detect(image, threshold)
            }
        }

        let dir = TempDir::new().unwrap();
        let pipeline = PlatePipeline::new(
            Arc::new(ScriptedDetector::new(
                "plate",
                vec![plate(0, 0, 40, 20, 0.9), plate(50, 0, 90, 20, 0.9)],
            )),
            Arc::new(FailingOnce(
                ScriptedDetector::new("char", vec![glyph(10, 10, 20, 20, 7, 0.9)]),
                std::sync::atomic::AtomicBool::new(false),
            )),
            Arc::new(Alphabet::default()),
            ArtifactStore::new(dir.path(), "results").unwrap(),
            Annotator::without_labels(),
            PipelineConfig::default(),
        )
        .unwrap();

        let result = pipeline.process(&png_bytes(100, 50), Thresholds::default()).unwrap();
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].index, 1);
        assert_eq!(result.detections[0].plate_string.as_str(), "7");
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("session poisoned"));
    }

    #[test]
    fn test_plate_detector_failure_is_fatal() {
        struct Broken;

        impl Detector for Broken {
            fn id(&self) -> &str {
                "plate"
            }

            fn detect(&self, _: &DynamicImage, _: Option<f32>) -> anyhow::Result<Vec<Detection>> {
                anyhow::bail!("model not loaded")
            }
        }

        let dir = TempDir::new().unwrap();
        let pipeline = PlatePipeline::new(
            Arc::new(Broken),
            Arc::new(ScriptedDetector::new("char", vec![])),
            Arc::new(Alphabet::default()),
            ArtifactStore::new(dir.path(), "results").unwrap(),
            Annotator::without_labels(),
            PipelineConfig::default(),
        )
        .unwrap();

        let err = pipeline
            .process(&png_bytes(10, 10), Thresholds::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_info_reports_configuration() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, vec![], vec![], PipelineConfig::default());

        let info = pipeline.info();
        assert_eq!(info.alphabet_version, "v5");
        assert_eq!(info.alphabet_len, 35);
        assert_eq!(info.plate_detector.id, "plate");
        assert_eq!(info.char_detector.id, "char");
        assert_eq!(info.default_plate_conf_threshold, 0.5);
        assert_eq!(info.char_crop_size, Some(640));
        assert!(pipeline.is_healthy());
    }
}
