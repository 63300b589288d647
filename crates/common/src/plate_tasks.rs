//! Plate recognition contracts shared between the recognition core and the
//! service layer.
//!
//! This module defines the detection value types, the per-plate and
//! per-image results, and the request/response bodies of the service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Plate string reported when no character survived filtering
pub const UNKNOWN_PLATE: &str = "UNKNOWN";

/// Axis-aligned box in pixel coordinates (x1, y1) inclusive, (x2, y2) exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    /// Vertical center, `(y1 + y2) / 2`
    pub fn vertical_center(&self) -> f32 {
        (self.y1 as f32 + self.y2 as f32) / 2.0
    }

    /// Clamp the box to an image of the given size.
    ///
    /// Returns `None` when nothing of the box is left inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let max_x = i32::try_from(width).unwrap_or(i32::MAX);
        let max_y = i32::try_from(height).unwrap_or(i32::MAX);

        let clamped = BoundingBox {
            x1: self.x1.clamp(0, max_x),
            y1: self.y1.clamp(0, max_y),
            x2: self.x2.clamp(0, max_x),
            y2: self.y2.clamp(0, max_y),
        };

        if clamped.x1 < clamped.x2 && clamped.y1 < clamped.y2 {
            Some(clamped)
        } else {
            None
        }
    }

    /// Intersection over Union with another box
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = if x2 > x1 && y2 > y1 {
            (x2 - x1) as f32 * (y2 - y1) as f32
        } else {
            0.0
        };

        let union = self.area() as f32 + other.area() as f32 - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A single detector output: box, class index and score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,

    /// Index into the detector's class table
    pub class_id: usize,

    /// Detection confidence (0.0 to 1.0)
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_id: usize, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
        }
    }
}

/// A detection expressed in one plate crop's local coordinate frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterDetection(pub Detection);

impl CharacterDetection {
    pub fn new(bbox: BoundingBox, class_id: usize, confidence: f32) -> Self {
        Self(Detection::new(bbox, class_id, confidence))
    }
}

impl Deref for CharacterDetection {
    type Target = Detection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Detection> for CharacterDetection {
    fn from(detection: Detection) -> Self {
        Self(detection)
    }
}

/// Text read from a plate, or the marker that nothing was read.
///
/// On the wire both variants are plain strings; `Unknown` is sent as
/// [`UNKNOWN_PLATE`]. A plate that literally reads `UNKNOWN` shares that
/// encoding and deserializes as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlateText {
    Recognized(String),
    Unknown,
}

impl PlateText {
    pub fn is_recognized(&self) -> bool {
        matches!(self, PlateText::Recognized(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            PlateText::Recognized(text) => text,
            PlateText::Unknown => UNKNOWN_PLATE,
        }
    }
}

impl fmt::Display for PlateText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for PlateText {
    fn from(value: String) -> Self {
        if value == UNKNOWN_PLATE {
            PlateText::Unknown
        } else {
            PlateText::Recognized(value)
        }
    }
}

impl From<PlateText> for String {
    fn from(value: PlateText) -> Self {
        match value {
            PlateText::Recognized(text) => text,
            PlateText::Unknown => UNKNOWN_PLATE.to_string(),
        }
    }
}

/// Recognition result for one plate detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateResult {
    /// Position of the plate box in the plate detector's output
    pub index: usize,

    /// Plate box in original-image coordinates, clamped to the image
    pub plate_box: BoundingBox,

    /// Artifact reference of the raw plate crop
    pub plate_crop_path: String,

    /// Artifact reference of the crop with character boxes drawn
    pub annotated_crop_path: String,

    pub plate_string: PlateText,

    /// Plate detector confidence for this box
    pub plate_confidence: f32,

    /// Characters in reading order, in the character crop's frame
    pub characters: Vec<CharacterDetection>,
}

/// Recognition result for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResult {
    /// Per-invocation id, embedded in every artifact name
    pub result_id: String,

    /// Artifact reference of the full image with plate boxes drawn
    pub annotated_image_path: String,

    pub image_width: u32,
    pub image_height: u32,

    pub detections: Vec<PlateResult>,

    /// Non-fatal problems, e.g. artifacts that could not be written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    pub processing_time_ms: u64,
}

/// Request to recognize plates in one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizeRequest {
    /// Encoded image bytes (base64)
    pub image: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_conf_threshold: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_conf_threshold: Option<f32>,
}

/// Request to recognize plates in an ordered batch of images
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecognizeRequest {
    /// Encoded image bytes (base64), processed in order
    pub images: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_conf_threshold: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_conf_threshold: Option<f32>,
}

/// Outcome of one image in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Completed { result: ImageResult },
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecognizeResponse {
    pub results: Vec<BatchItem>,
}

/// Metadata about one loaded detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorInfo {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,

    pub execution_provider: String,

    pub healthy: bool,
}

/// Static description of the running pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub alphabet_version: String,
    pub alphabet_len: usize,
    pub plate_detector: DetectorInfo,
    pub char_detector: DetectorInfo,
    pub default_plate_conf_threshold: f32,
    pub default_char_conf_threshold: f32,
    pub row_threshold_fraction: f32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_crop_size: Option<u32>,
}
